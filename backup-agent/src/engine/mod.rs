//! Backup engines: what produces backup bytes and what consumes them on restore.

pub mod clients;
pub mod image;
pub mod instance;
pub mod tar;
pub mod volume;

use crate::chain::Backup;
use crate::config::EngineConfig;
use crate::streaming::{BoundedChannel, ChunkStream};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

pub use clients::{
    BlockStorageApi, ClientManager, ComputeApi, ImageApi, ResourceStatus, ServerInfo, VolumeSource,
};
pub use image::ImageEngine;
pub use instance::InstanceEngine;
pub use tar::{Compression, Dereference, TarEngine, TarSettings};
pub use volume::VolumeEngine;

/// Engine-specific facts stored next to every backup and handed back on restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetadata {
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default)]
    pub encryption: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl EngineMetadata {
    pub fn for_engine(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
            ..Default::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

#[async_trait]
pub trait BackupEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Byte stream of `resource`. Engines that support increments read and
    /// update the manifest at `manifest_path`.
    async fn backup_data(&self, resource: &str, manifest_path: &Path) -> Result<ChunkStream>;

    /// Called once before the first level is restored.
    async fn prepare_restore(&self, _destination: &str, _overwrite: bool) -> Result<()> {
        Ok(())
    }

    /// Apply one level to `destination`, reading its bytes from `channel`.
    async fn restore_level(
        &self,
        destination: &str,
        channel: Arc<BoundedChannel>,
        backup: &Backup,
        metadata: &EngineMetadata,
    ) -> Result<()>;

    /// Metadata describing a backup of `resource`.
    async fn metadata(&self, resource: &str) -> Result<EngineMetadata>;
}

/// Poll cadence and deadline for long-running cloud operations.
#[derive(Debug, Clone, Copy)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Stream wrapper that runs a cleanup future once the stream is dropped,
/// whether it was drained, failed or abandoned.
pub struct CleanupStream {
    inner: ChunkStream,
    cleanup: Option<BoxFuture<'static, ()>>,
}

impl CleanupStream {
    pub fn new(inner: ChunkStream, cleanup: BoxFuture<'static, ()>) -> Self {
        Self {
            inner,
            cleanup: Some(cleanup),
        }
    }
}

impl Stream for CleanupStream {
    type Item = Result<bytes::Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for CleanupStream {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(cleanup);
            }
        }
    }
}

/// Build the configured engine. Cloud engines take their clients from `clients`.
pub fn from_config(config: &EngineConfig, clients: &ClientManager, wait: WaitSettings) -> Result<Arc<dyn BackupEngine>> {
    let engine: Arc<dyn BackupEngine> = match config {
        EngineConfig::Tar(settings) => Arc::new(TarEngine::new(settings.clone())),
        EngineConfig::Volume => Arc::new(VolumeEngine::new(
            clients.block_storage()?,
            clients.image()?,
            wait,
        )),
        EngineConfig::Image => Arc::new(ImageEngine::new(clients.image()?, wait)),
        EngineConfig::Instance => Arc::new(InstanceEngine::new(
            clients.compute()?,
            clients.image()?,
            wait,
        )),
    };
    Ok(engine)
}

/// Fail restores of encrypted backups when no key is configured.
pub(crate) fn require_key(metadata: &EngineMetadata, has_key: bool) -> Result<()> {
    if metadata.encryption && !has_key {
        return Err(AgentError::Engine(
            "backup is encrypted but no encryption key is configured".to_string(),
        ));
    }
    Ok(())
}
