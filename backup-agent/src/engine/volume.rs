//! Block-storage volume engine.
//!
//! Backup: snapshot the volume, clone the snapshot into a temporary volume,
//! copy that into a temporary image and stream the image. Restore: upload
//! the stream as an image and create a volume from it. Every temporary
//! resource is deleted whatever the outcome.

use crate::chain::Backup;
use crate::engine::clients::{wait_until, BlockStorageApi, ImageApi, ResourceStatus, VolumeSource};
use crate::engine::image::{discard_image, download_temporary, upload_image};
use crate::engine::{BackupEngine, EngineMetadata, WaitSettings};
use crate::streaming::{BoundedChannel, ChunkStream};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const ENGINE_NAME: &str = "volume";

pub struct VolumeEngine {
    block: Arc<dyn BlockStorageApi>,
    images: Arc<dyn ImageApi>,
    wait: WaitSettings,
}

impl VolumeEngine {
    pub fn new(block: Arc<dyn BlockStorageApi>, images: Arc<dyn ImageApi>, wait: WaitSettings) -> Self {
        Self { block, images, wait }
    }

    async fn volume_ready(&self, volume_id: &str) -> Result<()> {
        wait_until(
            &format!("volume {}", volume_id),
            ResourceStatus::Available,
            self.wait,
            || self.block.volume_status(volume_id),
        )
        .await
    }

    async fn discard_volume(&self, volume_id: &str) {
        if let Err(e) = self.block.delete_volume(volume_id).await {
            warn!("Failed to delete temporary volume {}: {}", volume_id, e);
        }
    }

    /// Temporary image holding the current contents of `volume_id`.
    async fn stage_image(&self, volume_id: &str, name: &str) -> Result<String> {
        let snapshot = self.block.create_snapshot(volume_id, name).await?;
        let staged = self.image_from_snapshot(&snapshot, name).await;
        if let Err(e) = self.block.delete_snapshot(&snapshot).await {
            warn!("Failed to delete temporary snapshot {}: {}", snapshot, e);
        }
        staged
    }

    async fn image_from_snapshot(&self, snapshot: &str, name: &str) -> Result<String> {
        wait_until(
            &format!("snapshot {}", snapshot),
            ResourceStatus::Available,
            self.wait,
            || self.block.snapshot_status(snapshot),
        )
        .await?;

        let volume = self
            .block
            .create_volume(VolumeSource::Snapshot(snapshot.to_string()), name)
            .await?;
        let staged = async {
            self.volume_ready(&volume).await?;
            let image = self.block.upload_to_image(&volume, name).await?;
            let active = wait_until(
                &format!("image {}", image),
                ResourceStatus::Active,
                self.wait,
                || self.images.image_status(&image),
            )
            .await;
            if let Err(e) = active {
                discard_image(self.images.as_ref(), &image).await;
                return Err(e);
            }
            Ok::<_, AgentError>(image)
        }
        .await;
        self.discard_volume(&volume).await;
        staged
    }
}

#[async_trait]
impl BackupEngine for VolumeEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn backup_data(&self, resource: &str, _manifest_path: &Path) -> Result<ChunkStream> {
        let name = format!("backup_{}_{}", resource, chrono::Utc::now().timestamp());
        let image = self.stage_image(resource, &name).await?;
        info!("Staged volume {} as image {}", resource, image);
        download_temporary(Arc::clone(&self.images), image).await
    }

    async fn restore_level(
        &self,
        destination: &str,
        channel: Arc<BoundedChannel>,
        backup: &Backup,
        _metadata: &EngineMetadata,
    ) -> Result<()> {
        let name = format!("restore_{}", backup);
        let image = upload_image(self.images.as_ref(), &name, channel, self.wait).await?;

        let restored = async {
            let volume = self
                .block
                .create_volume(VolumeSource::Image(image.clone()), destination)
                .await?;
            self.volume_ready(&volume).await?;
            Ok::<_, AgentError>(volume)
        }
        .await;
        discard_image(self.images.as_ref(), &image).await;

        let volume = restored?;
        info!("Restored {} into volume {}", backup, volume);
        Ok(())
    }

    async fn metadata(&self, resource: &str) -> Result<EngineMetadata> {
        Ok(EngineMetadata::for_engine(ENGINE_NAME).with("volume_id", resource))
    }
}
