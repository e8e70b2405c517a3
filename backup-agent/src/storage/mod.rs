//! Storage backends.
//!
//! Every backend implements [`Storage`]: enumerate a name's chains, stream
//! a backup in and out, store the small per-backup blobs (engine manifest
//! and engine metadata) and delete chains.

pub mod blocking;
pub mod fslike;
pub mod ftp;
pub mod local;
#[cfg(test)]
mod mock_server;
pub mod multiple;
pub mod s3;
pub mod ssh;
pub mod swift;

use crate::chain::{Backup, BackupId};
use crate::config::StorageConfig;
use crate::engine::EngineMetadata;
use crate::streaming::{BoundedChannel, ChunkStream};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use fslike::{FsBackend, FsLikeStorage};
pub use ftp::{FtpFs, FtpSettings, FtpStorage};
pub use local::{LocalFs, LocalStorage};
pub use multiple::MultipleStorage;
pub use s3::{S3Settings, S3Storage};
pub use ssh::{SftpFs, SshSettings, SshStorage};
pub use swift::{SwiftSettings, SwiftStorage};

/// Backend tag, used by engines and for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Swift,
    Ssh,
    Ftp,
    Ftps,
    Local,
    S3,
    Multiple,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageKind::Swift => "swift",
            StorageKind::Ssh => "ssh",
            StorageKind::Ftp => "ftp",
            StorageKind::Ftps => "ftps",
            StorageKind::Local => "local",
            StorageKind::S3 => "s3",
            StorageKind::Multiple => "multiple",
        };
        f.write_str(name)
    }
}

/// Summary of one storage location.
#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub kind: StorageKind,
    pub location: String,
    pub objects: Option<u64>,
    pub bytes: Option<u64>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Chunk size used when reading backups back.
    fn chunk_size(&self) -> usize;

    /// Root path, bucket or container.
    fn location(&self) -> String;

    /// Create directories/containers/buckets the backend needs.
    async fn prepare(&self) -> Result<()>;

    /// Level-0 backups (with increments attached) stored under `hostname_backup_name`.
    async fn find_all(&self, hostname_backup_name: &str) -> Result<Vec<Backup>>;

    /// Persist everything `channel` delivers as the data of `backup`.
    async fn write_backup(&self, channel: Arc<BoundedChannel>, backup: &Backup) -> Result<()>;

    /// Stream the data of `backup` back.
    async fn backup_blocks(&self, backup: &Backup) -> Result<ChunkStream>;

    /// Read a small blob; [`AgentError::NotFound`] if absent.
    async fn get_blob(&self, path: &str) -> Result<Bytes>;

    async fn put_blob(&self, path: &str, data: Bytes) -> Result<()>;

    /// Location of the engine manifest of `backup`.
    fn tar_metadata_path(&self, backup: &Backup) -> String;

    /// Location of the engine-metadata blob of `backup`.
    fn engine_metadata_path(&self, backup: &Backup) -> String;

    /// Delete a whole chain (`backup` must be level 0).
    async fn remove_backup(&self, backup: &Backup) -> Result<()>;

    /// Delete what a failed run left of `backup` alone: its data, partial
    /// uploads and sibling blobs. Missing objects are fine.
    async fn discard(&self, backup: &Backup) -> Result<()>;

    async fn info(&self) -> Result<Vec<StorageInfo>>;

    /// Fetch the manifest of `parent` into `to`.
    async fn download_meta_file(&self, parent: &Backup, to: &Path) -> Result<()> {
        if !parent.tar_meta() {
            return Err(AgentError::Policy(format!(
                "latest update {} has no tar metadata",
                parent
            )));
        }
        let data = self.get_blob(&self.tar_metadata_path(parent)).await?;
        if let Some(dir) = to.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(to, &data).await?;
        Ok(())
    }

    /// Store the manifest at `from` as the metadata sibling of `backup`.
    async fn upload_meta_file(&self, backup: &Backup, from: &Path) -> Result<()> {
        let data = tokio::fs::read(from).await?;
        self.put_blob(&self.tar_metadata_path(backup), Bytes::from(data))
            .await
    }

    async fn upload_engine_metadata(&self, backup: &Backup, metadata: &EngineMetadata) -> Result<()> {
        let data = serde_json::to_vec(metadata)?;
        self.put_blob(&self.engine_metadata_path(backup), Bytes::from(data))
            .await
    }

    async fn download_engine_metadata(&self, backup: &Backup) -> Result<EngineMetadata> {
        let data = self.get_blob(&self.engine_metadata_path(backup)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Remove every chain whose latest increment is older than `cutoff`.
    async fn remove_older_than(&self, cutoff: u64, hostname_backup_name: &str) -> Result<Vec<BackupId>> {
        let mut removed = Vec::new();
        for chain in self.find_all(hostname_backup_name).await? {
            if chain.latest_update().timestamp() >= cutoff {
                continue;
            }
            info!("Removing chain {} (latest update {})", chain, chain.latest_update());
            match chain.storage() {
                Some(origin) => origin.remove_backup(&chain).await?,
                None => self.remove_backup(&chain).await?,
            }
            removed.push(chain.id().clone());
        }
        Ok(removed)
    }
}

/// Build the configured storage.
pub fn from_config(config: &StorageConfig, max_segment_size: usize, queue_size: usize) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config {
        StorageConfig::Local { path } => Arc::new(LocalStorage::local(path, max_segment_size)),
        StorageConfig::Ssh(settings) => Arc::new(SshStorage::ssh(settings.clone(), max_segment_size)),
        StorageConfig::Ftp(settings) => Arc::new(FtpStorage::ftp(settings.clone(), false, max_segment_size)),
        StorageConfig::Ftps(settings) => Arc::new(FtpStorage::ftp(settings.clone(), true, max_segment_size)),
        StorageConfig::Swift(settings) => Arc::new(SwiftStorage::new(settings.clone(), max_segment_size)?),
        StorageConfig::S3(settings) => Arc::new(S3Storage::new(settings, max_segment_size)?),
        StorageConfig::Multiple { storages } => {
            if storages.is_empty() {
                return Err(AgentError::Config("multiple storage needs at least one backend".to_string()));
            }
            let children = storages
                .iter()
                .map(|c| from_config(c, max_segment_size, queue_size))
                .collect::<Result<Vec<_>>>()?;
            Arc::new(MultipleStorage::new(children, queue_size))
        }
    };
    Ok(storage)
}
