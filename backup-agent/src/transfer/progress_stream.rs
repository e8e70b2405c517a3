//! Stream wrapper reporting throughput of a chunk stream.

use crate::transfer::progress::{ProgressTracker, TransferProgress};
use crate::utils::errors::Result;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Callback for progress updates
pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Counts the bytes passing through and calls `callback` at most every
/// `update_interval`, plus once at the end of the stream.
pub struct ProgressStream<S> {
    inner: S,
    tracker: ProgressTracker,
    last_update: Instant,
    update_interval: Duration,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes>>,
{
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self {
            inner,
            tracker: ProgressTracker::new(),
            last_update: Instant::now(),
            update_interval: Duration::from_secs(10),
            callback,
        }
    }

    pub fn with_interval(mut self, update_interval: Duration) -> Self {
        self.update_interval = update_interval;
        self
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.tracker.progress().transferred_bytes
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.tracker.record_chunk(bytes.len() as u64);

                let now = Instant::now();
                if now.duration_since(self.last_update) >= self.update_interval {
                    self.last_update = now;
                    let progress = self.tracker.update().clone();
                    (self.callback)(&progress);
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                // Final update on completion
                let average = self.tracker.average_speed();
                let mut progress = self.tracker.progress().clone();
                progress.bytes_per_second = average;
                (self.callback)(&progress);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
