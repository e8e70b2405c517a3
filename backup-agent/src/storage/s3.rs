//! S3-compatible object storage.
//!
//! Keys mirror the filesystem layout:
//! `{prefix}/{hostname_backup_name}/{level0_timestamp}/{backup}`.

use crate::chain::{parse_backups, Backup};
use crate::storage::{Storage, StorageInfo, StorageKind};
use crate::streaming::{BoundedChannel, ChunkStream};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Smallest part size S3 accepts for all but the last part.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    /// `bucket` or `bucket/prefix`.
    pub storage_path: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn s3_error<E: std::error::Error>(context: &str, e: E) -> AgentError {
    AgentError::Storage(format!("{}: {}", context, DisplayErrorContext(e)))
}

/// Split `bucket/some/prefix` into its bucket and prefix.
fn split_storage_path(path: &str) -> Result<(String, String)> {
    let path = path.trim_matches('/');
    let (bucket, prefix) = path.split_once('/').unwrap_or((path, ""));
    if bucket.is_empty() {
        return Err(AgentError::Config(format!(
            "s3 storage path {:?} has no bucket",
            path
        )));
    }
    Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
    part_size: usize,
}

impl S3Storage {
    pub fn new(settings: &S3Settings, max_segment_size: usize) -> Result<Self> {
        let (bucket, prefix) = split_storage_path(&settings.storage_path)?;
        let credentials = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "chain-backup-agent",
        );
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        info!("S3 storage initialized: bucket={}, prefix={}", bucket, prefix);
        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket,
            prefix,
            part_size: max_segment_size.max(MIN_PART_SIZE),
        })
    }

    fn key(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }

    fn chain_prefix(&self, backup: &Backup) -> String {
        self.key(&format!(
            "{}/{}/",
            backup.hostname_backup_name(),
            backup.full_backup_timestamp()
        ))
    }

    fn data_key(&self, backup: &Backup) -> String {
        format!("{}{}", self.chain_prefix(backup), backup.id())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| s3_error("list objects", e))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn upload_part(&self, key: &str, upload_id: &str, number: i32, data: Bytes) -> Result<CompletedPart> {
        debug!("Uploading part {} of {} ({} bytes)", number, key, data.len());
        let part = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| s3_error("upload part", e))?;
        Ok(CompletedPart::builder()
            .part_number(number)
            .e_tag(part.e_tag().unwrap_or_default())
            .build())
    }

    /// Stream the channel into a multipart upload already started as `upload_id`.
    async fn upload_parts(
        &self,
        channel: &BoundedChannel,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut buffer = BytesMut::with_capacity(self.part_size);
        while let Some(chunk) = channel.recv().await? {
            buffer.extend_from_slice(&chunk);
            if buffer.len() >= self.part_size {
                let number = parts.len() as i32 + 1;
                let data = buffer.split().freeze();
                parts.push(self.upload_part(key, upload_id, number, data).await?);
            }
        }
        if !buffer.is_empty() || parts.is_empty() {
            let number = parts.len() as i32 + 1;
            parts.push(self.upload_part(key, upload_id, number, buffer.freeze()).await?);
        }
        Ok(parts)
    }

    /// Deleting a missing key succeeds on S3.
    async fn delete_key(&self, key: &str) -> Result<()> {
        debug!("Deleting {}", key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error("delete object", e))?;
        Ok(())
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!("Failed to abort multipart upload of {}: {}", key, DisplayErrorContext(e));
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn kind(&self) -> StorageKind {
        StorageKind::S3
    }

    fn chunk_size(&self) -> usize {
        self.part_size
    }

    fn location(&self) -> String {
        if self.prefix.is_empty() {
            self.bucket.clone()
        } else {
            format!("{}/{}", self.bucket, self.prefix)
        }
    }

    async fn prepare(&self) -> Result<()> {
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            return Ok(());
        }
        info!("Creating bucket {}", self.bucket);
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| s3_error("create bucket", e))?;
        Ok(())
    }

    async fn find_all(&self, hostname_backup_name: &str) -> Result<Vec<Backup>> {
        let keys = self
            .list_keys(&self.key(&format!("{}/", hostname_backup_name)))
            .await?;
        let names = keys.iter().filter_map(|k| k.rsplit('/').next());
        Ok(parse_backups(names)
            .into_iter()
            .filter(|b| b.hostname_backup_name() == hostname_backup_name)
            .collect())
    }

    async fn write_backup(&self, channel: Arc<BoundedChannel>, backup: &Backup) -> Result<()> {
        let key = self.data_key(backup);
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| s3_error("create multipart upload", e))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| AgentError::Storage("no upload id returned".to_string()))?
            .to_string();

        let parts = match self.upload_parts(&channel, &key, &upload_id).await {
            Ok(parts) => parts,
            Err(e) => {
                self.abort(&key, &upload_id).await;
                return Err(e);
            }
        };

        let count = parts.len();
        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
        {
            self.abort(&key, &upload_id).await;
            return Err(s3_error("complete multipart upload", e));
        }
        info!("Uploaded {} in {} parts", key, count);
        Ok(())
    }

    async fn backup_blocks(&self, backup: &Backup) -> Result<ChunkStream> {
        let key = self.data_key(backup);
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| s3_error("get object", e))?;
        Ok(stream::unfold(object.body, |mut body| async move {
            body.next().await.map(|chunk| {
                (
                    chunk.map_err(|e| AgentError::Storage(format!("read object: {}", e))),
                    body,
                )
            })
        })
        .boxed())
    }

    async fn get_blob(&self, path: &str) -> Result<Bytes> {
        let object = match self.client.get_object().bucket(&self.bucket).key(path).send().await {
            Ok(object) => object,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                return Err(AgentError::NotFound(path.to_string()))
            }
            Err(e) => return Err(s3_error("get object", e)),
        };
        let data = object
            .body
            .collect()
            .await
            .map_err(|e| AgentError::Storage(format!("read object: {}", e)))?;
        Ok(data.into_bytes())
    }

    async fn put_blob(&self, path: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| s3_error("put object", e))?;
        Ok(())
    }

    fn tar_metadata_path(&self, backup: &Backup) -> String {
        format!("{}{}", self.chain_prefix(backup), backup.tar_metadata_name())
    }

    fn engine_metadata_path(&self, backup: &Backup) -> String {
        format!("{}{}", self.chain_prefix(backup), backup.engine_metadata_name())
    }

    async fn remove_backup(&self, backup: &Backup) -> Result<()> {
        for key in self.list_keys(&self.chain_prefix(backup)).await? {
            self.delete_key(&key).await?;
        }
        Ok(())
    }

    async fn discard(&self, backup: &Backup) -> Result<()> {
        let keys = [
            self.data_key(backup),
            self.tar_metadata_path(backup),
            self.engine_metadata_path(backup),
        ];
        for key in keys {
            self.delete_key(&key).await?;
        }
        Ok(())
    }

    async fn info(&self) -> Result<Vec<StorageInfo>> {
        Ok(vec![StorageInfo {
            kind: StorageKind::S3,
            location: self.location(),
            objects: None,
            bytes: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mock_server::ObjectStore;
    use crate::streaming::chunk_stream;

    fn settings(path: &str) -> S3Settings {
        S3Settings {
            storage_path: path.to_string(),
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            region: default_region(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
        }
    }

    #[test]
    fn test_split_storage_path() {
        assert_eq!(split_storage_path("bucket").unwrap(), ("bucket".to_string(), String::new()));
        assert_eq!(
            split_storage_path("/bucket/a/b/").unwrap(),
            ("bucket".to_string(), "a/b".to_string())
        );
        assert!(split_storage_path("/").is_err());
    }

    #[tokio::test]
    async fn test_keys_follow_chain_layout() {
        let storage = S3Storage::new(&settings("bucket/backups"), 1024).unwrap();
        let full = Backup::full("host_db", 1000);
        let inc = Backup::next_level(&full.clone().with_tar_meta(true), 2000).unwrap();

        assert_eq!(storage.data_key(&full), "backups/host_db/1000/host_db_1000_0");
        assert_eq!(storage.data_key(&inc), "backups/host_db/1000/host_db_2000_1");
        assert_eq!(
            storage.tar_metadata_path(&inc),
            "backups/host_db/1000/tar_metadata_host_db_2000_1"
        );
        assert_eq!(storage.location(), "bucket/backups");
    }

    #[tokio::test]
    async fn test_part_size_has_floor() {
        let storage = S3Storage::new(&settings("bucket"), 1024).unwrap();
        assert_eq!(storage.chunk_size(), MIN_PART_SIZE);
        assert_eq!(storage.key("x"), "x");
    }

    async fn served(store: &ObjectStore) -> S3Storage {
        let mut settings = settings("bucket");
        settings.endpoint = Some(store.serve_s3().await);
        S3Storage::new(&settings, 1024).unwrap()
    }

    async fn write(storage: &S3Storage, backup: &Backup, data: &'static [u8]) -> Result<()> {
        let channel = BoundedChannel::new(4);
        channel
            .put_messages(chunk_stream(vec![Bytes::from_static(data)]))
            .await
            .unwrap();
        storage.write_backup(channel, backup).await
    }

    #[tokio::test]
    async fn test_multipart_upload_completes_and_lists() {
        let store = ObjectStore::default();
        let storage = served(&store).await;
        let full = Backup::full("host_db", 1000);

        write(&storage, &full, b"level zero").await.unwrap();

        assert_eq!(
            store.log(),
            vec![
                "create host_db/1000/host_db_1000_0",
                "part 1 host_db/1000/host_db_1000_0",
                "complete host_db/1000/host_db_1000_0",
            ]
        );
        let chains = storage.find_all("host_db").await.unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].timestamp(), 1000);
    }

    #[tokio::test]
    async fn test_failed_part_aborts_upload() {
        let store = ObjectStore::default();
        let storage = served(&store).await;
        store.fail_on("part 1");
        let full = Backup::full("host_db", 1000);

        let err = write(&storage, &full, b"level zero").await.unwrap_err();
        assert!(matches!(err, AgentError::Storage(_)));

        let log = store.log();
        assert_eq!(log.first().map(String::as_str), Some("create host_db/1000/host_db_1000_0"));
        assert_eq!(log.last().map(String::as_str), Some("abort host_db/1000/host_db_1000_0"));
        assert!(!log.iter().any(|entry| entry.starts_with("complete")));
        assert!(storage.find_all("host_db").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_drops_level_and_blobs() {
        let store = ObjectStore::default();
        let storage = served(&store).await;
        let full = Backup::full("host_db", 1000);
        write(&storage, &full, b"level zero").await.unwrap();
        storage
            .put_blob(&storage.tar_metadata_path(&full), Bytes::from_static(b"manifest"))
            .await
            .unwrap();
        assert!(storage.find_all("host_db").await.unwrap()[0].tar_meta());

        storage.discard(&full).await.unwrap();
        assert!(store.keys().is_empty());
        assert!(storage.find_all("host_db").await.unwrap().is_empty());
    }
}
