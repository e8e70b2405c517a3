//! Compute-instance engine: snapshots a server into an image and streams it;
//! restore boots a new server with the original flavor.

use crate::chain::Backup;
use crate::engine::clients::{wait_until, ComputeApi, ImageApi, ResourceStatus};
use crate::engine::image::{discard_image, download_temporary, upload_image};
use crate::engine::{BackupEngine, EngineMetadata, WaitSettings};
use crate::streaming::{BoundedChannel, ChunkStream};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub const ENGINE_NAME: &str = "instance";

pub struct InstanceEngine {
    compute: Arc<dyn ComputeApi>,
    images: Arc<dyn ImageApi>,
    wait: WaitSettings,
}

impl InstanceEngine {
    pub fn new(compute: Arc<dyn ComputeApi>, images: Arc<dyn ImageApi>, wait: WaitSettings) -> Self {
        Self { compute, images, wait }
    }
}

#[async_trait]
impl BackupEngine for InstanceEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn backup_data(&self, resource: &str, _manifest_path: &Path) -> Result<ChunkStream> {
        let server = self.compute.get_server(resource).await?;
        let name = format!("backup_{}_{}", server.name, chrono::Utc::now().timestamp());
        let image = self.compute.create_server_image(&server.id, &name).await?;

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
        info!("Snapshotted server {} as image {}", server.id, image);
        download_temporary(Arc::clone(&self.images), image).await
    }

    async fn restore_level(
        &self,
        destination: &str,
        channel: Arc<BoundedChannel>,
        backup: &Backup,
        metadata: &EngineMetadata,
    ) -> Result<()> {
        let flavor_id = metadata
            .extra_str("flavor_id")
            .ok_or_else(|| AgentError::Engine(format!("metadata of {} has no flavor", backup)))?
            .to_string();

        let name = format!("restore_{}", backup);
        let image = upload_image(self.images.as_ref(), &name, channel, self.wait).await?;

        let booted = async {
            let server = self.compute.boot_server(destination, &image, &flavor_id).await?;
            wait_until(
                &format!("server {}", server),
                ResourceStatus::Active,
                self.wait,
                || self.compute.server_status(&server),
            )
            .await?;
            Ok::<_, AgentError>(server)
        }
        .await;
        discard_image(self.images.as_ref(), &image).await;

        let server = booted?;
        info!("Restored {} as server {}", backup, server);
        Ok(())
    }

    async fn metadata(&self, resource: &str) -> Result<EngineMetadata> {
        let server = self.compute.get_server(resource).await?;
        Ok(EngineMetadata::for_engine(ENGINE_NAME)
            .with("server_id", server.id)
            .with("server_name", server.name)
            .with("flavor_id", server.flavor_id))
    }
}
