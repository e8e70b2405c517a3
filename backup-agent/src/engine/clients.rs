//! Capability interfaces of the cloud services cloud engines drive.
//!
//! The agent ships no concrete clients; a deployment plugs its own
//! implementations into [`ClientManager`]. A missing capability surfaces as
//! [`AgentError::Unavailable`] when an engine needing it is built.

use crate::engine::WaitSettings;
use crate::streaming::ChunkStream;
use crate::utils::errors::{AgentError, Result};
use crate::utils::wait_for;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Lifecycle state reported by a cloud resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    Creating,
    Available,
    Active,
    InUse,
    Error,
    Other(String),
}

impl ResourceStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "creating" | "queued" | "saving" | "build" => ResourceStatus::Creating,
            "available" => ResourceStatus::Available,
            "active" => ResourceStatus::Active,
            "in-use" => ResourceStatus::InUse,
            "error" | "killed" => ResourceStatus::Error,
            other => ResourceStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Creating => write!(f, "creating"),
            ResourceStatus::Available => write!(f, "available"),
            ResourceStatus::Active => write!(f, "active"),
            ResourceStatus::InUse => write!(f, "in-use"),
            ResourceStatus::Error => write!(f, "error"),
            ResourceStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    Snapshot(String),
    Image(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub flavor_id: String,
    pub status: ResourceStatus,
}

#[async_trait]
pub trait BlockStorageApi: Send + Sync {
    async fn create_snapshot(&self, volume_id: &str, name: &str) -> Result<String>;
    async fn snapshot_status(&self, snapshot_id: &str) -> Result<ResourceStatus>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
    async fn create_volume(&self, source: VolumeSource, name: &str) -> Result<String>;
    async fn volume_status(&self, volume_id: &str) -> Result<ResourceStatus>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
    /// Start copying a volume into a new image; returns the image id.
    async fn upload_to_image(&self, volume_id: &str, image_name: &str) -> Result<String>;
}

#[async_trait]
pub trait ImageApi: Send + Sync {
    async fn create_image(&self, name: &str) -> Result<String>;
    async fn upload(&self, image_id: &str, data: ChunkStream) -> Result<()>;
    async fn download(&self, image_id: &str) -> Result<ChunkStream>;
    async fn image_status(&self, image_id: &str) -> Result<ResourceStatus>;
    async fn delete_image(&self, image_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn get_server(&self, server_id: &str) -> Result<ServerInfo>;
    /// Snapshot a server into a new image; returns the image id.
    async fn create_server_image(&self, server_id: &str, image_name: &str) -> Result<String>;
    async fn boot_server(&self, name: &str, image_id: &str, flavor_id: &str) -> Result<String>;
    async fn server_status(&self, server_id: &str) -> Result<ResourceStatus>;
}

/// Clients for the cloud services available to this run.
#[derive(Clone, Default)]
pub struct ClientManager {
    block_storage: Option<Arc<dyn BlockStorageApi>>,
    image: Option<Arc<dyn ImageApi>>,
    compute: Option<Arc<dyn ComputeApi>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_storage(mut self, client: Arc<dyn BlockStorageApi>) -> Self {
        self.block_storage = Some(client);
        self
    }

    pub fn with_image(mut self, client: Arc<dyn ImageApi>) -> Self {
        self.image = Some(client);
        self
    }

    pub fn with_compute(mut self, client: Arc<dyn ComputeApi>) -> Self {
        self.compute = Some(client);
        self
    }

    pub fn block_storage(&self) -> Result<Arc<dyn BlockStorageApi>> {
        self.block_storage
            .clone()
            .ok_or_else(|| AgentError::Unavailable("block storage client".to_string()))
    }

    pub fn image(&self) -> Result<Arc<dyn ImageApi>> {
        self.image
            .clone()
            .ok_or_else(|| AgentError::Unavailable("image client".to_string()))
    }

    pub fn compute(&self) -> Result<Arc<dyn ComputeApi>> {
        self.compute
            .clone()
            .ok_or_else(|| AgentError::Unavailable("compute client".to_string()))
    }
}

/// Poll `status` until it reports `target`; an `Error` status fails at once.
pub(crate) async fn wait_until<F, Fut>(
    what: &str,
    target: ResourceStatus,
    wait: WaitSettings,
    mut status: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ResourceStatus>>,
{
    let message = format!("{} did not become {}", what, target);
    wait_for(
        || {
            let poll = status();
            let target = target.clone();
            async move {
                match poll.await? {
                    current if current == target => Ok(true),
                    ResourceStatus::Error => Err(AgentError::Engine(format!("{} is in error state", what))),
                    _ => Ok(false),
                }
            }
        },
        wait.poll_interval,
        wait.timeout,
        &message,
    )
    .await
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(ResourceStatus::parse("AVAILABLE"), ResourceStatus::Available);
        assert_eq!(ResourceStatus::parse("in-use"), ResourceStatus::InUse);
        assert_eq!(ResourceStatus::parse("queued"), ResourceStatus::Creating);
        assert_eq!(ResourceStatus::parse("weird"), ResourceStatus::Other("weird".to_string()));
    }

    #[tokio::test]
    async fn test_wait_until_error_status_fails_fast() {
        let wait = WaitSettings {
            poll_interval: std::time::Duration::from_millis(1),
            timeout: std::time::Duration::from_secs(5),
        };
        let result = wait_until("volume v", ResourceStatus::Available, wait, || async {
            Ok(ResourceStatus::Error)
        })
        .await;
        assert!(matches!(result, Err(AgentError::Engine(_))));
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let wait = WaitSettings {
            poll_interval: std::time::Duration::from_millis(1),
            timeout: std::time::Duration::from_millis(5),
        };
        let result = wait_until("image i", ResourceStatus::Active, wait, || async {
            Ok(ResourceStatus::Creating)
        })
        .await;
        assert!(matches!(result, Err(AgentError::Timeout(_))));
    }

    #[test]
    fn test_missing_capability_is_unavailable() {
        let clients = ClientManager::new();
        assert!(matches!(clients.image(), Err(AgentError::Unavailable(_))));
        assert!(matches!(clients.compute(), Err(AgentError::Unavailable(_))));
        assert!(matches!(clients.block_storage(), Err(AgentError::Unavailable(_))));
    }
}
