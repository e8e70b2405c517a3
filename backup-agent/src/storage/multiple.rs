//! Replication of every backup to several storages.

use crate::chain::Backup;
use crate::engine::EngineMetadata;
use crate::storage::{Storage, StorageInfo, StorageKind};
use crate::streaming::{BoundedChannel, ChunkStream, ErrorLog, FanOut, QueuedWorker};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Writes go to every child; reads come from the child a backup was listed from.
pub struct MultipleStorage {
    storages: Vec<Arc<dyn Storage>>,
    queue_size: usize,
}

impl MultipleStorage {
    pub fn new(storages: Vec<Arc<dyn Storage>>, queue_size: usize) -> Self {
        Self {
            storages,
            queue_size,
        }
    }

    pub fn storages(&self) -> &[Arc<dyn Storage>] {
        &self.storages
    }

    /// Child holding `backup`, falling back to the first one.
    fn origin(&self, backup: &Backup) -> Result<Arc<dyn Storage>> {
        backup
            .storage()
            .cloned()
            .or_else(|| self.storages.first().cloned())
            .ok_or_else(|| AgentError::Config("multiple storage has no backends".to_string()))
    }
}

#[async_trait]
impl Storage for MultipleStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Multiple
    }

    fn chunk_size(&self) -> usize {
        self.storages
            .iter()
            .map(|s| s.chunk_size())
            .min()
            .unwrap_or(1)
    }

    fn location(&self) -> String {
        self.storages
            .iter()
            .map(|s| s.location())
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn prepare(&self) -> Result<()> {
        for storage in &self.storages {
            storage.prepare().await?;
        }
        Ok(())
    }

    /// Chains of every child, each tagged with the child it came from.
    async fn find_all(&self, hostname_backup_name: &str) -> Result<Vec<Backup>> {
        let mut all = Vec::new();
        for storage in &self.storages {
            for mut chain in storage.find_all(hostname_backup_name).await? {
                chain.attach_storage(Arc::clone(storage));
                all.push(chain);
            }
        }
        Ok(all)
    }

    /// Fan the channel out to one writer per child; any failure fails the write.
    async fn write_backup(&self, channel: Arc<BoundedChannel>, backup: &Backup) -> Result<()> {
        let errors = ErrorLog::new();
        let mut outputs = Vec::with_capacity(self.storages.len());
        let mut workers = Vec::with_capacity(self.storages.len());

        for (i, storage) in self.storages.iter().enumerate() {
            let output = channel.child(self.queue_size);
            let storage = Arc::clone(storage);
            let backup = backup.clone();
            workers.push(QueuedWorker::spawn(
                format!("write[{}:{}]", i, storage.kind()),
                Arc::clone(&output),
                errors.clone(),
                move |ch| async move { storage.write_backup(ch, &backup).await },
            ));
            outputs.push(output);
        }

        let transmitted = FanOut::new(channel, outputs).transmit().await;
        for worker in workers {
            let _ = worker.join().await;
        }
        if let Err(e) = &transmitted {
            if errors.is_empty() {
                errors.push("fan-out", e.to_string());
            }
        }
        errors.into_result()?;

        let bytes = transmitted?;
        info!("Replicated {} bytes to {} storages", bytes, self.storages.len());
        Ok(())
    }

    async fn backup_blocks(&self, backup: &Backup) -> Result<ChunkStream> {
        self.origin(backup)?.backup_blocks(backup).await
    }

    /// First child that has the blob.
    async fn get_blob(&self, path: &str) -> Result<Bytes> {
        let mut last = AgentError::NotFound(path.to_string());
        for storage in &self.storages {
            match storage.get_blob(path).await {
                Ok(data) => return Ok(data),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    async fn put_blob(&self, path: &str, data: Bytes) -> Result<()> {
        for storage in &self.storages {
            storage.put_blob(path, data.clone()).await?;
        }
        Ok(())
    }

    fn tar_metadata_path(&self, backup: &Backup) -> String {
        backup.tar_metadata_name()
    }

    fn engine_metadata_path(&self, backup: &Backup) -> String {
        backup.engine_metadata_name()
    }

    async fn remove_backup(&self, backup: &Backup) -> Result<()> {
        match backup.storage() {
            Some(origin) => origin.remove_backup(backup).await,
            None => {
                for storage in &self.storages {
                    storage.remove_backup(backup).await?;
                }
                Ok(())
            }
        }
    }

    /// Every child is cleaned even when one of them fails.
    async fn discard(&self, backup: &Backup) -> Result<()> {
        let mut first = None;
        for storage in &self.storages {
            if let Err(e) = storage.discard(backup).await {
                warn!("Failed to discard {} on {}: {}", backup, storage.kind(), e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn info(&self) -> Result<Vec<StorageInfo>> {
        let mut all = Vec::new();
        for storage in &self.storages {
            all.extend(storage.info().await?);
        }
        Ok(all)
    }

    async fn download_meta_file(&self, parent: &Backup, to: &Path) -> Result<()> {
        self.origin(parent)?.download_meta_file(parent, to).await
    }

    async fn upload_meta_file(&self, backup: &Backup, from: &Path) -> Result<()> {
        for storage in &self.storages {
            storage.upload_meta_file(backup, from).await?;
        }
        Ok(())
    }

    async fn upload_engine_metadata(&self, backup: &Backup, metadata: &EngineMetadata) -> Result<()> {
        for storage in &self.storages {
            storage.upload_engine_metadata(backup, metadata).await?;
        }
        Ok(())
    }

    async fn download_engine_metadata(&self, backup: &Backup) -> Result<EngineMetadata> {
        if let Some(origin) = backup.storage() {
            return origin.download_engine_metadata(backup).await;
        }
        let mut last = AgentError::NotFound(backup.engine_metadata_name());
        for storage in &self.storages {
            match storage.download_engine_metadata(backup).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => {
                    warn!("No engine metadata for {} on {}: {}", backup, storage.kind(), e);
                    last = e;
                }
            }
        }
        Err(last)
    }
}
