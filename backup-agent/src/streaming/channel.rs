//! Bounded single-producer/single-consumer chunk channel.
//!
//! Producers block in [`BoundedChannel::put`] while the queue is full,
//! consumers loop on [`BoundedChannel::has_more`]. Either side can call
//! [`BoundedChannel::force_stop`], after which the other side's next
//! `put`/`get`/`has_more` fails with [`AgentError::Cancelled`].

use crate::utils::errors::{AgentError, Result};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long a blocked side sleeps before re-checking state.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of in-flight chunks.
pub const DEFAULT_CAPACITY: usize = 10;

/// Finite, non-restartable sequence of byte chunks.
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// Outcome of a non-blocking [`BoundedChannel::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    Chunk(Bytes),
    /// Nothing queued right now; re-check `has_more()`.
    Empty,
}

pub struct BoundedChannel {
    queue: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    finished: AtomicBool,
    stop: CancellationToken,
    readable: Notify,
    writable: Notify,
}

impl BoundedChannel {
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_token(capacity, CancellationToken::new())
    }

    /// Create a channel that is also force-stopped when `stop` is cancelled.
    pub fn with_token(capacity: usize, stop: CancellationToken) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            finished: AtomicBool::new(false),
            stop,
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    /// New channel stopped together with this one, but not the other way round.
    pub fn child(&self, capacity: usize) -> Arc<Self> {
        Self::with_token(capacity, self.stop.child_token())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    async fn park(&self, notify: &Notify) {
        tokio::select! {
            _ = notify.notified() => {}
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }

    /// Enqueue one chunk, waiting for room.
    pub async fn put(&self, chunk: Bytes) -> Result<()> {
        loop {
            self.check_stop()?;
            {
                let mut queue = self.lock();
                if queue.len() < self.capacity {
                    queue.push_back(chunk);
                    drop(queue);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            self.park(&self.writable).await;
        }
    }

    /// Pop one chunk without waiting.
    pub fn get(&self) -> Result<Recv> {
        self.check_stop()?;
        let chunk = self.lock().pop_front();
        match chunk {
            Some(chunk) => {
                self.writable.notify_one();
                Ok(Recv::Chunk(chunk))
            }
            None => Ok(Recv::Empty),
        }
    }

    /// True until `finish()` was called and the queue drained.
    pub fn has_more(&self) -> Result<bool> {
        self.check_stop()?;
        Ok(!self.finished.load(Ordering::Acquire) || !self.lock().is_empty())
    }

    /// Wait for the next chunk; `None` once the producer finished and the queue is drained.
    pub async fn recv(&self) -> Result<Option<Bytes>> {
        while self.has_more()? {
            match self.get()? {
                Recv::Chunk(chunk) => return Ok(Some(chunk)),
                Recv::Empty => self.park(&self.readable).await,
            }
        }
        Ok(None)
    }

    /// Push every chunk of `chunks`, then mark the channel finished.
    pub async fn put_messages(&self, mut chunks: ChunkStream) -> Result<()> {
        while let Some(chunk) = chunks.next().await {
            self.put(chunk?).await?;
        }
        self.finish();
        Ok(())
    }

    /// No more chunks will be enqueued; what is queued still drains.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.readable.notify_one();
    }

    /// Abort the transfer on both ends.
    pub fn force_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Consume the channel as a chunk stream ending after the first error.
    pub fn into_stream(self: Arc<Self>) -> ChunkStream {
        stream::unfold(Some(self), |state| async move {
            let channel = state?;
            match channel.recv().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(channel))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

/// Stream over an in-memory list of chunks.
pub fn chunk_stream<I>(chunks: I) -> ChunkStream
where
    I: IntoIterator<Item = Bytes>,
    I::IntoIter: Send + 'static,
{
    stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// Re-slice `chunks` into pieces of exactly `size` bytes; only the last
/// piece may be shorter. An upstream error ends the stream.
pub fn rechunk(chunks: ChunkStream, size: usize) -> ChunkStream {
    let size = size.max(1);
    stream::unfold(
        (chunks, BytesMut::new(), false),
        move |(mut chunks, mut buffer, mut done)| async move {
            loop {
                if buffer.len() >= size {
                    let piece = buffer.split_to(size).freeze();
                    return Some((Ok(piece), (chunks, buffer, done)));
                }
                if done {
                    if buffer.is_empty() {
                        return None;
                    }
                    let rest = buffer.split().freeze();
                    return Some((Ok(rest), (chunks, buffer, done)));
                }
                match chunks.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), (chunks, BytesMut::new(), true))),
                    None => done = true,
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_in_order() {
        let channel = BoundedChannel::new(4);
        channel.put(Bytes::from_static(b"a")).await.unwrap();
        channel.put(Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(channel.get().unwrap(), Recv::Chunk(Bytes::from_static(b"a")));
        assert_eq!(channel.get().unwrap(), Recv::Chunk(Bytes::from_static(b"b")));
        assert_eq!(channel.get().unwrap(), Recv::Empty);
    }

    #[tokio::test]
    async fn test_has_more_until_finished_and_drained() {
        let channel = BoundedChannel::new(2);
        assert!(channel.has_more().unwrap());

        channel.put(Bytes::from_static(b"x")).await.unwrap();
        channel.finish();
        assert!(channel.has_more().unwrap());

        assert!(matches!(channel.get().unwrap(), Recv::Chunk(_)));
        assert!(!channel.has_more().unwrap());
    }

    #[tokio::test]
    async fn test_put_blocks_when_full() {
        let channel = BoundedChannel::new(1);
        channel.put(Bytes::from_static(b"1")).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            channel.put(Bytes::from_static(b"2")),
        )
        .await;
        assert!(blocked.is_err(), "second put should wait for room");

        assert!(matches!(channel.get().unwrap(), Recv::Chunk(_)));
        channel.put(Bytes::from_static(b"2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_stop_releases_blocked_producer() {
        let channel = BoundedChannel::new(1);
        channel.put(Bytes::from_static(b"1")).await.unwrap();

        let producer = Arc::clone(&channel);
        let handle = tokio::spawn(async move { producer.put(Bytes::from_static(b"2")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.force_stop();

        let result = tokio::time::timeout(POLL_INTERVAL, handle)
            .await
            .expect("producer must return within one poll interval")
            .unwrap();
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert!(matches!(channel.has_more(), Err(AgentError::Cancelled)));
        assert!(matches!(channel.get(), Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_force_stop_releases_waiting_consumer() {
        let channel = BoundedChannel::new(1);
        let consumer = Arc::clone(&channel);
        let handle = tokio::spawn(async move { consumer.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.force_stop();

        let result = tokio::time::timeout(POLL_INTERVAL, handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_put_messages_delivers_everything() {
        let channel = BoundedChannel::new(2);
        let producer = Arc::clone(&channel);
        let chunks: Vec<Bytes> = (0..20u8).map(|i| Bytes::from(vec![i])).collect();
        let expected = chunks.clone();

        let handle = tokio::spawn(async move { producer.put_messages(chunk_stream(chunks)).await });

        let mut received = Vec::new();
        while let Some(chunk) = channel.recv().await.unwrap() {
            received.push(chunk);
        }
        handle.await.unwrap().unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_parent_token_stops_child() {
        let parent = BoundedChannel::new(1);
        let child = parent.child(1);

        parent.force_stop();
        assert!(child.is_stopped());

        let other = BoundedChannel::new(1);
        let other_child = other.child(1);
        other_child.force_stop();
        assert!(!other.is_stopped());
    }

    #[tokio::test]
    async fn test_rechunk_splits_and_joins() {
        let chunks = chunk_stream(vec![
            Bytes::from_static(b"abcdefghij"),
            Bytes::from_static(b"k"),
            Bytes::from_static(b"lm"),
        ]);
        let pieces: Vec<Bytes> = rechunk(chunks, 4)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(pieces, vec![&b"abcd"[..], &b"efgh"[..], &b"ijkl"[..], &b"m"[..]]);
    }

    #[tokio::test]
    async fn test_rechunk_stops_after_error() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(AgentError::Storage("reset".into())),
            Ok(Bytes::from_static(b"cd")),
        ])
        .boxed();
        let items: Vec<Result<Bytes>> = rechunk(chunks, 4).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(AgentError::Storage(_))));
    }
}
