//! Polling helper that turns asynchronous cloud operations into synchronous ones.

use crate::utils::errors::{AgentError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Poll `condition` until it reports `true`.
///
/// Sleeps `poll_interval` between checks. Fails with [`AgentError::Timeout`]
/// carrying `message` once the accumulated wait reaches `timeout`. An error
/// returned by `condition` itself is propagated immediately.
pub async fn wait_for<F, Fut>(
    mut condition: F,
    poll_interval: Duration,
    timeout: Duration,
    message: &str,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut remaining = timeout;
    while !remaining.is_zero() {
        if condition().await? {
            return Ok(());
        }
        debug!("Waiting {:?} before re-checking: {}", poll_interval, message);
        tokio::time::sleep(poll_interval).await;
        remaining = remaining.saturating_sub(poll_interval);
    }

    Err(AgentError::Timeout(message.to_string()))
}
