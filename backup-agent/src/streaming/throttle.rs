//! Bandwidth limits for chunk streams.

use crate::streaming::ChunkStream;
use futures_util::stream::{self, StreamExt};
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket refilled at `rate` bytes per second, holding at most one
/// second of budget. A chunk larger than the budget leaves the bucket in
/// debt and the next chunk waits it off.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_second: u64) -> Self {
        let rate = bytes_per_second.max(1) as f64;
        Self {
            rate,
            tokens: rate,
            last: Instant::now(),
        }
    }

    /// Take `amount` bytes out of the bucket and return how long to wait
    /// before sending them.
    pub fn reserve(&mut self, amount: usize) -> Duration {
        let now = Instant::now();
        let refill = now.duration_since(self.last).as_secs_f64() * self.rate;
        self.tokens = (self.tokens + refill).min(self.rate) - amount as f64;
        self.last = now;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// Limit `chunks` to `bytes_per_second`; `None` passes the stream through.
pub fn throttle(chunks: ChunkStream, bytes_per_second: Option<u64>) -> ChunkStream {
    let Some(rate) = bytes_per_second else {
        return chunks;
    };
    stream::unfold((chunks, TokenBucket::new(rate)), |(mut chunks, mut bucket)| async move {
        let item = chunks.next().await?;
        if let Ok(chunk) = &item {
            let wait = bucket.reserve(chunk.len());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        Some((item, (chunks, bucket)))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::chunk_stream;
    use bytes::Bytes;

    fn chunks(count: usize, size: usize) -> ChunkStream {
        chunk_stream((0..count).map(move |_| Bytes::from(vec![0u8; size])).collect::<Vec<_>>())
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_spreads_chunks_over_time() {
        let start = Instant::now();
        let total: usize = throttle(chunks(5, 100), Some(100))
            .map(|c| c.unwrap().len())
            .fold(0, |acc, n| async move { acc + n })
            .await;

        assert_eq!(total, 500);
        // First second of budget is free, the other four chunks wait.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3990), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_chunk_is_paid_off_by_the_next() {
        let mut bucket = TokenBucket::new(1000);
        assert_eq!(bucket.reserve(3000), Duration::from_secs(2));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(bucket.reserve(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_is_immediate() {
        let start = Instant::now();
        let count = throttle(chunks(50, 1024), None).count().await;
        assert_eq!(count, 50);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
