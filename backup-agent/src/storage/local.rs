//! Local filesystem storage.

use crate::storage::fslike::{FsBackend, FsLikeStorage};
use crate::storage::StorageKind;
use crate::streaming::ChunkStream;
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Local directory tree.
#[derive(Debug, Clone, Default)]
pub struct LocalFs;

pub type LocalStorage = FsLikeStorage<LocalFs>;

impl FsLikeStorage<LocalFs> {
    pub fn local(root: impl AsRef<Path>, chunk_size: usize) -> Self {
        FsLikeStorage::new(LocalFs, root.as_ref().to_string_lossy().into_owned(), chunk_size)
    }
}

fn not_found(path: &str, e: std::io::Error) -> AgentError {
    if e.kind() == ErrorKind::NotFound {
        AgentError::NotFound(path.to_string())
    } else {
        AgentError::Io(e)
    }
}

#[async_trait]
impl FsBackend for LocalFs {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn listdir(&self, dir: &str) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn create_dirs(&self, dir: &str) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    async fn rmtree(&self, dir: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| not_found(path, e))
    }

    async fn write_file(&self, path: &str, data: Bytes) -> Result<()> {
        tokio::fs::write(path, &data).await?;
        Ok(())
    }

    async fn read_stream(&self, path: &str, chunk_size: usize) -> Result<ChunkStream> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| not_found(path, e))?;
        Ok(ReaderStream::with_capacity(file, chunk_size)
            .map(|chunk| chunk.map_err(AgentError::from))
            .boxed())
    }

    async fn write_stream(&self, path: &str, mut chunks: ChunkStream) -> Result<u64> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
