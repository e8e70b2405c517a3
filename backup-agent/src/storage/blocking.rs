//! Bridges between chunk streams and blocking client libraries (ssh2, ftp).

use crate::streaming::ChunkStream;
use crate::utils::errors::{AgentError, Result};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::io::Read;
use tokio::sync::mpsc;

/// In-flight chunks between the async side and the blocking thread.
const BRIDGE_DEPTH: usize = 2;

/// Chunks handed to a blocking writer; ends when the async side is done.
pub struct BlockingChunks {
    rx: mpsc::Receiver<Bytes>,
}

impl Iterator for BlockingChunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.rx.blocking_recv()
    }
}

/// Run `sink` on the blocking pool and feed it every chunk of `chunks`.
///
/// An upstream error still lets the sink finish, then is returned.
pub async fn write_blocking<F>(mut chunks: ChunkStream, sink: F) -> Result<u64>
where
    F: FnOnce(BlockingChunks) -> Result<u64> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(BRIDGE_DEPTH);
    let handle = tokio::task::spawn_blocking(move || sink(BlockingChunks { rx }));

    let mut upstream = None;
    while let Some(item) = chunks.next().await {
        match item {
            Ok(chunk) => {
                // Receiver gone means the sink failed; its error comes from the join.
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                upstream = Some(e);
                break;
            }
        }
    }
    drop(tx);

    let written = handle.await??;
    match upstream {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

/// Run `source` on the blocking pool and stream what it sends.
pub fn read_blocking<F>(source: F) -> ChunkStream
where
    F: FnOnce(&mpsc::Sender<Result<Bytes>>) -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(BRIDGE_DEPTH);
    tokio::task::spawn_blocking(move || {
        if let Err(e) = source(&tx) {
            let _ = tx.blocking_send(Err(e));
        }
    });
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Copy `reader` to `tx` in chunks of at most `chunk_size` bytes.
///
/// Returns early without error if the receiving side went away.
pub fn pump<R: Read>(reader: &mut R, chunk_size: usize, tx: &mpsc::Sender<Result<Bytes>>) -> Result<()> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
            return Ok(());
        }
    }
}

/// Join a blocking closure and flatten its result.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AgentError::Storage(format!("blocking storage task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::chunk_stream;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_write_blocking_sees_all_chunks() {
        let chunks = chunk_stream(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde")]);
        let written = write_blocking(chunks, |incoming| {
            let all: Vec<u8> = incoming.flat_map(|c| c.to_vec()).collect();
            assert_eq!(all, b"abcde");
            Ok(all.len() as u64)
        })
        .await
        .unwrap();
        assert_eq!(written, 5);
    }

    #[tokio::test]
    async fn test_write_blocking_reports_upstream_error() {
        let chunks = stream::iter(vec![Ok(Bytes::from_static(b"a")), Err(AgentError::Cancelled)]).boxed();
        let result = write_blocking(chunks, |incoming| Ok(incoming.count() as u64)).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_read_blocking_chunks_reader() {
        let stream = read_blocking(|tx| pump(&mut Cursor::new(b"0123456789".to_vec()), 4, tx));
        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_read_blocking_surfaces_source_error() {
        let stream = read_blocking(|_| Err(AgentError::NotFound("x".to_string())));
        let items: Vec<Result<Bytes>> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(AgentError::NotFound(_))));
    }
}
