//! Image-service engine: backs up an image's bytes and restores them as a new image.

use crate::chain::Backup;
use crate::engine::clients::{wait_until, ImageApi, ResourceStatus};
use crate::engine::{BackupEngine, CleanupStream, EngineMetadata, WaitSettings};
use crate::streaming::{BoundedChannel, ChunkStream};
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const ENGINE_NAME: &str = "image";

/// Delete an image, logging instead of failing.
pub(crate) async fn discard_image(images: &dyn ImageApi, image_id: &str) {
    if let Err(e) = images.delete_image(image_id).await {
        warn!("Failed to delete temporary image {}: {}", image_id, e);
    }
}

/// Download `image_id` and delete it once the stream is gone.
pub(crate) async fn download_temporary(images: Arc<dyn ImageApi>, image_id: String) -> Result<ChunkStream> {
    let stream = match images.download(&image_id).await {
        Ok(stream) => stream,
        Err(e) => {
            discard_image(images.as_ref(), &image_id).await;
            return Err(e);
        }
    };
    let cleanup = async move { discard_image(images.as_ref(), &image_id).await }.boxed();
    Ok(Box::pin(CleanupStream::new(stream, cleanup)))
}

/// Create an image named `name` from the channel and wait for it to go active.
///
/// A half-built image is deleted before the error is returned.
pub(crate) async fn upload_image(
    images: &dyn ImageApi,
    name: &str,
    channel: Arc<BoundedChannel>,
    wait: WaitSettings,
) -> Result<String> {
    let image_id = images.create_image(name).await?;
    let uploaded = async {
        images.upload(&image_id, channel.into_stream()).await?;
        wait_until(
            &format!("image {}", image_id),
            ResourceStatus::Active,
            wait,
            || images.image_status(&image_id),
        )
        .await
    }
    .await;
    if let Err(e) = uploaded {
        discard_image(images, &image_id).await;
        return Err(e);
    }
    Ok(image_id)
}

pub struct ImageEngine {
    images: Arc<dyn ImageApi>,
    wait: WaitSettings,
}

impl ImageEngine {
    pub fn new(images: Arc<dyn ImageApi>, wait: WaitSettings) -> Self {
        Self { images, wait }
    }
}

#[async_trait]
impl BackupEngine for ImageEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn backup_data(&self, resource: &str, _manifest_path: &Path) -> Result<ChunkStream> {
        wait_until(
            &format!("image {}", resource),
            ResourceStatus::Active,
            self.wait,
            || self.images.image_status(resource),
        )
        .await?;
        self.images.download(resource).await
    }

    async fn restore_level(
        &self,
        destination: &str,
        channel: Arc<BoundedChannel>,
        backup: &Backup,
        _metadata: &EngineMetadata,
    ) -> Result<()> {
        let image_id = upload_image(self.images.as_ref(), destination, channel, self.wait).await?;
        info!("Restored {} as image {}", backup, image_id);
        Ok(())
    }

    async fn metadata(&self, resource: &str) -> Result<EngineMetadata> {
        Ok(EngineMetadata::for_engine(ENGINE_NAME).with("image_id", resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clients::fakes::FakeCloud;
    use crate::streaming::chunk_stream;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn wait() -> WaitSettings {
        WaitSettings {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_backup_streams_image_bytes() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.put_image("img-src", b"hello image");
        let engine = ImageEngine::new(cloud.clone(), wait());

        let mut stream = engine.backup_data("img-src", Path::new("/unused")).await.unwrap();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(data, b"hello image");
    }

    #[tokio::test]
    async fn test_restore_creates_active_image() {
        let cloud = Arc::new(FakeCloud {
            settle_polls: 2,
            ..Default::default()
        });
        let engine = ImageEngine::new(cloud.clone(), wait());

        let channel = BoundedChannel::new(4);
        channel
            .put_messages(chunk_stream(vec![Bytes::from_static(b"abc")]))
            .await
            .unwrap();
        engine
            .restore_level("restored", channel, &Backup::full("a", 1), &EngineMetadata::for_engine(ENGINE_NAME))
            .await
            .unwrap();

        let images = cloud.live_images();
        assert_eq!(images.len(), 1);
        assert_eq!(cloud.image_data(&images[0]).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_image() {
        let cloud = Arc::new(FakeCloud {
            fail_uploads: true,
            ..Default::default()
        });
        let engine = ImageEngine::new(cloud.clone(), wait());
        let channel = BoundedChannel::new(4);
        channel.finish();

        let result = engine
            .restore_level("restored", channel, &Backup::full("a", 1), &EngineMetadata::for_engine(ENGINE_NAME))
            .await;
        assert!(result.is_err());
        assert!(cloud.live_images().is_empty());
    }

    #[tokio::test]
    async fn test_temporary_download_is_deleted_afterwards() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.put_image("tmp", b"1234567890");

        let stream = download_temporary(cloud.clone(), "tmp".to_string()).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 3);

        for _ in 0..50 {
            if cloud.live_images().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("temporary image survived");
    }
}
