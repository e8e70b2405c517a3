//! OpenStack Swift object storage.
//!
//! Backup data is uploaded as numbered segments into a segments container
//! and published through a dynamic large object manifest in the main
//! container. The manifest goes up last, so a failed upload never shows
//! in a listing. Authentication happens outside the agent: the storage URL
//! and token are configured directly.

use crate::chain::{parse_backups, Backup};
use crate::storage::{Storage, StorageInfo, StorageKind};
use crate::streaming::{rechunk, BoundedChannel, ChunkStream};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwiftSettings {
    /// Account URL, e.g. `https://swift.example.com/v1/AUTH_tenant`.
    pub storage_url: String,
    pub auth_token: String,
    pub container: String,
    /// Defaults to `{container}_segments`.
    #[serde(default)]
    pub segments_container: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
}

pub struct SwiftStorage {
    client: Client,
    storage_url: String,
    auth_token: String,
    container: String,
    segments: String,
    max_segment_size: usize,
}

impl SwiftStorage {
    pub fn new(settings: SwiftSettings, max_segment_size: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        let segments = settings
            .segments_container
            .clone()
            .unwrap_or_else(|| format!("{}_segments", settings.container));
        Ok(Self {
            client,
            storage_url: settings.storage_url.trim_end_matches('/').to_string(),
            auth_token: settings.auth_token,
            container: settings.container,
            segments,
            max_segment_size: max_segment_size.max(1),
        })
    }

    fn url(&self, container: &str, object: Option<&str>) -> String {
        match object {
            Some(object) => format!("{}/{}/{}", self.storage_url, container, object),
            None => format!("{}/{}", self.storage_url, container),
        }
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("X-Auth-Token", &self.auth_token)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(AgentError::NotFound(what.to_string())),
            status if !status.is_success() => Err(AgentError::Storage(format!(
                "swift {} failed with {}",
                what, status
            ))),
            _ => Ok(response),
        }
    }

    async fn put_object(&self, container: &str, object: &str, body: Bytes) -> Result<()> {
        let request = self
            .request(Method::PUT, self.url(container, Some(object)))
            .body(body);
        self.send(request, object).await?;
        Ok(())
    }

    async fn delete_object(&self, container: &str, object: &str) -> Result<()> {
        let request = self.request(Method::DELETE, self.url(container, Some(object)));
        match self.send(request, object).await {
            Ok(_) | Err(AgentError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every object name in `container` starting with `prefix`.
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut marker = String::new();
        loop {
            let request = self
                .request(Method::GET, self.url(container, None))
                .query(&[("format", "json"), ("prefix", prefix), ("marker", marker.as_str())]);
            let page: Vec<ListedObject> = match self.send(request, container).await {
                Ok(response) => response.json().await?,
                Err(AgentError::NotFound(_)) => Vec::new(),
                Err(e) => return Err(e),
            };
            let Some(last) = page.last() else {
                break;
            };
            marker = last.name.clone();
            names.extend(page.into_iter().map(|o| o.name));
        }
        Ok(names)
    }

    fn segment_prefix(&self, backup: &Backup) -> String {
        format!("{}/", backup.id())
    }

    fn segment_name(&self, backup: &Backup, index: usize) -> String {
        format!(
            "{}{}/{}/{:08}",
            self.segment_prefix(backup),
            backup.timestamp(),
            self.max_segment_size,
            index
        )
    }

    async fn upload_segment(&self, backup: &Backup, index: usize, data: Bytes) -> Result<()> {
        let name = self.segment_name(backup, index);
        debug!("Uploading segment {} ({} bytes)", name, data.len());
        self.put_object(&self.segments, &name, data).await
    }

    async fn upload_manifest(&self, backup: &Backup) -> Result<()> {
        let manifest = format!("{}/{}", self.segments, self.segment_prefix(backup));
        let request = self
            .request(Method::PUT, self.url(&self.container, Some(&backup.id().to_string())))
            .header("X-Object-Manifest", manifest)
            .body(Bytes::new());
        self.send(request, "manifest upload").await?;
        info!("Published manifest for {}", backup);
        Ok(())
    }

    async fn remove_one(&self, backup: &Backup) -> Result<()> {
        for segment in self.list(&self.segments, &self.segment_prefix(backup)).await? {
            self.delete_object(&self.segments, &segment).await?;
        }
        self.delete_object(&self.container, &backup.tar_metadata_name()).await?;
        self.delete_object(&self.container, &backup.engine_metadata_name()).await?;
        self.delete_object(&self.container, &backup.id().to_string()).await
    }
}

#[async_trait]
impl Storage for SwiftStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Swift
    }

    fn chunk_size(&self) -> usize {
        self.max_segment_size
    }

    fn location(&self) -> String {
        self.url(&self.container, None)
    }

    async fn prepare(&self) -> Result<()> {
        for container in [&self.container, &self.segments] {
            let request = self.request(Method::PUT, self.url(container, None));
            self.send(request, container).await?;
        }
        Ok(())
    }

    async fn find_all(&self, hostname_backup_name: &str) -> Result<Vec<Backup>> {
        let mut names = self
            .list(&self.container, &format!("{}_", hostname_backup_name))
            .await?;
        names.extend(
            self.list(&self.container, &format!("{}{}_", crate::chain::TAR_METADATA_PREFIX, hostname_backup_name))
                .await?,
        );
        Ok(parse_backups(names)
            .into_iter()
            .filter(|b| b.hostname_backup_name() == hostname_backup_name)
            .collect())
    }

    async fn write_backup(&self, channel: Arc<BoundedChannel>, backup: &Backup) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(self.max_segment_size);
        let mut index = 0usize;
        while let Some(chunk) = channel.recv().await? {
            buffer.extend_from_slice(&chunk);
            while buffer.len() >= self.max_segment_size {
                let segment = buffer.split_to(self.max_segment_size).freeze();
                self.upload_segment(backup, index, segment).await?;
                index += 1;
            }
        }
        if !buffer.is_empty() || index == 0 {
            self.upload_segment(backup, index, buffer.freeze()).await?;
        }
        self.upload_manifest(backup).await
    }

    async fn backup_blocks(&self, backup: &Backup) -> Result<ChunkStream> {
        let request = self.request(Method::GET, self.url(&self.container, Some(&backup.id().to_string())));
        let response = self.send(request, &backup.id().to_string()).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(AgentError::from))
            .boxed();
        Ok(rechunk(body, self.max_segment_size))
    }

    async fn get_blob(&self, path: &str) -> Result<Bytes> {
        let request = self.request(Method::GET, self.url(&self.container, Some(path)));
        Ok(self.send(request, path).await?.bytes().await?)
    }

    async fn put_blob(&self, path: &str, data: Bytes) -> Result<()> {
        self.put_object(&self.container, path, data).await
    }

    fn tar_metadata_path(&self, backup: &Backup) -> String {
        backup.tar_metadata_name()
    }

    fn engine_metadata_path(&self, backup: &Backup) -> String {
        backup.engine_metadata_name()
    }

    async fn remove_backup(&self, backup: &Backup) -> Result<()> {
        let mut chain = backup.chain();
        chain.reverse();
        for level in chain {
            info!("Removing {}", level);
            if let Err(e) = self.remove_one(level).await {
                warn!("Failed to remove {}: {}", level, e);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn discard(&self, backup: &Backup) -> Result<()> {
        self.remove_one(backup).await
    }

    async fn info(&self) -> Result<Vec<StorageInfo>> {
        let request = self.request(Method::HEAD, self.url(&self.container, None));
        let response = self.send(request, &self.container).await?;
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        };
        Ok(vec![StorageInfo {
            kind: StorageKind::Swift,
            location: self.location(),
            objects: header("X-Container-Object-Count"),
            bytes: header("X-Container-Bytes-Used"),
        }])
    }
}
