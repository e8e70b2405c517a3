//! Storage on anything that looks like a filesystem (local disk, SFTP, FTP).
//!
//! Layout under the storage root:
//!
//! ```text
//! {root}/{hostname_backup_name}/{level0_timestamp}/{backup}
//! {root}/{hostname_backup_name}/{level0_timestamp}/tar_metadata_{backup}
//! {root}/{hostname_backup_name}/{level0_timestamp}/engine_metadata_{backup}
//! ```
//!
//! Data is streamed into `{backup}.partial` and renamed once complete, so a
//! listing never shows a half-written level.

use crate::chain::{parse_backups, Backup, PARTIAL_SUFFIX};
use crate::storage::{Storage, StorageInfo, StorageKind};
use crate::streaming::{BoundedChannel, ChunkStream};
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Primitive operations of a filesystem-like backend. Paths use `/`.
#[async_trait]
pub trait FsBackend: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Entry names of `dir`; a missing directory is empty.
    async fn listdir(&self, dir: &str) -> Result<Vec<String>>;

    /// Create `dir` and its parents; existing directories are fine.
    async fn create_dirs(&self, dir: &str) -> Result<()>;

    /// Remove `dir` recursively; a missing directory is fine.
    async fn rmtree(&self, dir: &str) -> Result<()>;

    /// Whole-file read; [`crate::AgentError::NotFound`] if absent.
    async fn read_file(&self, path: &str) -> Result<Bytes>;

    async fn write_file(&self, path: &str, data: Bytes) -> Result<()>;

    async fn read_stream(&self, path: &str, chunk_size: usize) -> Result<ChunkStream>;

    /// Write every chunk to `path`, returning the byte count.
    async fn write_stream(&self, path: &str, chunks: ChunkStream) -> Result<u64>;

    /// Move `from` to `to`, replacing `to`.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Delete one file; a missing file is fine.
    async fn remove_file(&self, path: &str) -> Result<()>;
}

pub(crate) fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

pub(crate) fn parent_dir(path: &str) -> Option<&str> {
    path.rfind('/').filter(|&i| i > 0).map(|i| &path[..i])
}

pub struct FsLikeStorage<F> {
    fs: F,
    root: String,
    chunk_size: usize,
}

impl<F: FsBackend> FsLikeStorage<F> {
    pub fn new(fs: F, root: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            fs,
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn backend(&self) -> &F {
        &self.fs
    }

    /// Directory holding a whole chain.
    fn chain_dir(&self, backup: &Backup) -> String {
        join(
            &join(&self.root, backup.hostname_backup_name()),
            &backup.full_backup_timestamp().to_string(),
        )
    }

    fn data_path(&self, backup: &Backup) -> String {
        join(&self.chain_dir(backup), &backup.id().to_string())
    }

    fn partial_path(&self, backup: &Backup) -> String {
        format!("{}{}", self.data_path(backup), PARTIAL_SUFFIX)
    }
}

#[async_trait]
impl<F: FsBackend> Storage for FsLikeStorage<F> {
    fn kind(&self) -> StorageKind {
        self.fs.kind()
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn location(&self) -> String {
        self.root.clone()
    }

    async fn prepare(&self) -> Result<()> {
        self.fs.create_dirs(&self.root).await
    }

    async fn find_all(&self, hostname_backup_name: &str) -> Result<Vec<Backup>> {
        let name_dir = join(&self.root, hostname_backup_name);
        let mut names = Vec::new();
        for timestamp_dir in self.fs.listdir(&name_dir).await? {
            names.extend(self.fs.listdir(&join(&name_dir, &timestamp_dir)).await?);
        }
        debug!("Listed {} entries under {}", names.len(), name_dir);
        Ok(parse_backups(names)
            .into_iter()
            .filter(|b| b.hostname_backup_name() == hostname_backup_name)
            .collect())
    }

    async fn write_backup(&self, channel: Arc<BoundedChannel>, backup: &Backup) -> Result<()> {
        self.fs.create_dirs(&self.chain_dir(backup)).await?;
        let partial = self.partial_path(backup);
        let written = match self.fs.write_stream(&partial, channel.into_stream()).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = self.fs.remove_file(&partial).await {
                    warn!("Failed to remove {}: {}", partial, cleanup);
                }
                return Err(e);
            }
        };
        let path = self.data_path(backup);
        self.fs.rename(&partial, &path).await?;
        info!("Wrote {} bytes to {}", written, path);
        Ok(())
    }

    async fn backup_blocks(&self, backup: &Backup) -> Result<ChunkStream> {
        self.fs.read_stream(&self.data_path(backup), self.chunk_size).await
    }

    async fn get_blob(&self, path: &str) -> Result<Bytes> {
        self.fs.read_file(path).await
    }

    async fn put_blob(&self, path: &str, data: Bytes) -> Result<()> {
        if let Some(dir) = parent_dir(path) {
            self.fs.create_dirs(dir).await?;
        }
        self.fs.write_file(path, data).await
    }

    fn tar_metadata_path(&self, backup: &Backup) -> String {
        join(&self.chain_dir(backup), &backup.tar_metadata_name())
    }

    fn engine_metadata_path(&self, backup: &Backup) -> String {
        join(&self.chain_dir(backup), &backup.engine_metadata_name())
    }

    async fn remove_backup(&self, backup: &Backup) -> Result<()> {
        let dir = self.chain_dir(backup);
        info!("Removing {}", dir);
        self.fs.rmtree(&dir).await
    }

    async fn discard(&self, backup: &Backup) -> Result<()> {
        let paths = [
            self.partial_path(backup),
            self.data_path(backup),
            self.tar_metadata_path(backup),
            self.engine_metadata_path(backup),
        ];
        for path in paths {
            self.fs.remove_file(&path).await?;
        }
        Ok(())
    }

    async fn info(&self) -> Result<Vec<StorageInfo>> {
        Ok(vec![StorageInfo {
            kind: self.kind(),
            location: self.root.clone(),
            objects: None,
            bytes: None,
        }])
    }
}
