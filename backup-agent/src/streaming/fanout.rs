//! Republishes one upstream channel to several downstream channels.

use crate::streaming::channel::BoundedChannel;
use crate::utils::errors::{AgentError, Result};
use std::sync::Arc;
use tracing::error;

/// Copies every chunk of `input` to all `outputs`.
///
/// A failure to publish to any output stops the upstream producer and
/// every output: replication is all or nothing.
pub struct FanOut {
    input: Arc<BoundedChannel>,
    outputs: Vec<Arc<BoundedChannel>>,
}

impl FanOut {
    pub fn new(input: Arc<BoundedChannel>, outputs: Vec<Arc<BoundedChannel>>) -> Self {
        Self { input, outputs }
    }

    fn fail_all(&self, index: Option<usize>, cause: AgentError) -> AgentError {
        match index {
            Some(i) => error!("Output {} rejected chunk, stopping all outputs: {}", i, cause),
            None => error!("Upstream failed, stopping all outputs: {}", cause),
        }
        self.input.force_stop();
        for output in &self.outputs {
            output.force_stop();
        }
        cause
    }

    /// Drain the input into every output, then finish the outputs.
    pub async fn transmit(&self) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let chunk = match self.input.recv().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(self.fail_all(None, e)),
            };
            total += chunk.len() as u64;
            for (i, output) in self.outputs.iter().enumerate() {
                if let Err(e) = output.put(chunk.clone()).await {
                    return Err(self.fail_all(Some(i), e));
                }
            }
        }

        for output in &self.outputs {
            output.finish();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::chunk_stream;
    use bytes::Bytes;

    async fn drain(channel: Arc<BoundedChannel>) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        while let Some(chunk) = channel.recv().await? {
            out.push(chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_every_output_receives_same_sequence() {
        let input = BoundedChannel::new(2);
        let outputs: Vec<_> = (0..3).map(|_| input.child(2)).collect();
        let chunks: Vec<Bytes> = (0..10u8).map(|i| Bytes::from(vec![i; 3])).collect();

        let producer = {
            let input = Arc::clone(&input);
            let chunks = chunks.clone();
            tokio::spawn(async move { input.put_messages(chunk_stream(chunks)).await })
        };
        let readers: Vec<_> = outputs
            .iter()
            .map(|o| tokio::spawn(drain(Arc::clone(o))))
            .collect();

        let total = FanOut::new(Arc::clone(&input), outputs).transmit().await.unwrap();
        producer.await.unwrap().unwrap();

        assert_eq!(total, 30);
        for reader in readers {
            assert_eq!(reader.await.unwrap().unwrap(), chunks);
        }
    }

    #[tokio::test]
    async fn test_one_broken_output_stops_everything() {
        let input = BoundedChannel::new(1);
        let healthy = input.child(1);
        let broken = input.child(1);
        broken.force_stop();

        let producer = {
            let input = Arc::clone(&input);
            tokio::spawn(async move {
                input
                    .put_messages(chunk_stream(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]))
                    .await
            })
        };

        let result = FanOut::new(Arc::clone(&input), vec![Arc::clone(&healthy), broken])
            .transmit()
            .await;

        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert!(input.is_stopped());
        assert!(healthy.is_stopped());
        // The producer may have queued everything before the stop landed.
        let _ = producer.await.unwrap();
    }
}
