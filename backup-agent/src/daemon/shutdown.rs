//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the coordinator's token. Every channel of a running
//! transfer holds a child of that token, so both workers of the transfer
//! stop and the operation fails with [`AgentError::Cancelled`].
//!
//! [`AgentError::Cancelled`]: crate::utils::errors::AgentError::Cancelled

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to executors; cancelled on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel everything holding the token.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Graceful shutdown initiated");
            self.token.cancel();
        }
    }

    /// Wait for SIGTERM or SIGINT, then shut down.
    ///
    /// Returns without cancelling if the handlers cannot be installed or the
    /// token was cancelled by someone else.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), stopping transfers...");
            }
            _ = terminate => {
                info!("Received SIGTERM, stopping transfers...");
            }
            _ = self.token.cancelled() => return,
        }

        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::BoundedChannel;
    use crate::utils::errors::AgentError;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_shutdown_stops_channels() {
        let coordinator = ShutdownCoordinator::new();
        let channel = BoundedChannel::with_token(2, coordinator.token().child_token());

        coordinator.shutdown();

        assert!(coordinator.is_shutting_down());
        assert!(channel.is_stopped());
        assert!(matches!(
            channel.put(Bytes::from_static(b"x")).await,
            Err(AgentError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_signal_returns_after_external_cancel() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = coordinator.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_signal().await });

        coordinator.shutdown();
        handle.await.unwrap();
    }
}
