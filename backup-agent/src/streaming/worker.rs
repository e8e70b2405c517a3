//! Worker tasks bound to a [`BoundedChannel`].

use crate::streaming::channel::BoundedChannel;
use crate::utils::errors::{AgentError, Result, WorkerFailure};
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Side channel collecting worker failures of one transfer.
#[derive(Clone, Default)]
pub struct ErrorLog {
    failures: Arc<Mutex<Vec<WorkerFailure>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, worker: &str, message: String) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(WorkerFailure {
                worker: worker.to_string(),
                message,
            });
    }

    pub fn is_empty(&self) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn drain(&self) -> Vec<WorkerFailure> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// `Err(Transfer)` carrying every recorded failure, if any.
    pub fn into_result(self) -> Result<()> {
        let failures = self.drain();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Transfer(failures))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A spawned producer or consumer.
///
/// A failing (or panicking) task records its error in the [`ErrorLog`] and
/// force-stops its channel, so the paired worker fails fast instead of
/// waiting on a peer that is gone.
pub struct QueuedWorker {
    name: String,
    handle: JoinHandle<Result<()>>,
}

impl QueuedWorker {
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        channel: Arc<BoundedChannel>,
        errors: ErrorLog,
        task: F,
    ) -> Self
    where
        F: FnOnce(Arc<BoundedChannel>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let worker_name = name.clone();
        let fut = task(Arc::clone(&channel));

        let handle = tokio::spawn(async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(AgentError::Engine(format!(
                    "worker panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };

            if let Err(e) = &result {
                error!("Worker {} failed: {}", worker_name, e);
                errors.push(&worker_name, e.to_string());
                channel.force_stop();
            } else {
                debug!("Worker {} finished", worker_name);
            }
            result
        });

        Self { name, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the task to end and return its own result.
    pub async fn join(self) -> Result<()> {
        self.handle.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::chunk_stream;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_failure_is_logged_and_stops_channel() {
        let channel = BoundedChannel::new(2);
        let errors = ErrorLog::new();

        let worker = QueuedWorker::spawn("producer", Arc::clone(&channel), errors.clone(), |_| async {
            Err::<(), _>(AgentError::Engine("tar exited with 2".into()))
        });

        assert!(worker.join().await.is_err());
        assert!(channel.is_stopped());

        let failures = errors.drain();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].worker, "producer");
        assert!(failures[0].message.contains("tar exited with 2"));
    }

    #[tokio::test]
    async fn test_panic_is_converted_to_failure() {
        let channel = BoundedChannel::new(2);
        let errors = ErrorLog::new();

        let worker = QueuedWorker::spawn("consumer", Arc::clone(&channel), errors.clone(), |_| async {
            let explode = true;
            if explode {
                panic!("boom");
            }
            Ok::<(), AgentError>(())
        });

        let err = worker.join().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(channel.is_stopped());
        assert!(!errors.is_empty());
    }

    #[tokio::test]
    async fn test_producer_failure_unblocks_consumer() {
        let channel = BoundedChannel::new(1);
        let errors = ErrorLog::new();

        let consumer = QueuedWorker::spawn("consumer", Arc::clone(&channel), errors.clone(), |ch| async move {
            while ch.recv().await?.is_some() {}
            Ok::<(), AgentError>(())
        });
        let producer = QueuedWorker::spawn("producer", Arc::clone(&channel), errors.clone(), |ch| async move {
            ch.put(Bytes::from_static(b"first")).await?;
            Err::<(), AgentError>(AgentError::Engine("disk vanished".into()))
        });

        assert!(producer.join().await.is_err());
        assert!(matches!(consumer.join().await, Err(AgentError::Cancelled)));
        assert!(matches!(errors.into_result(), Err(AgentError::Transfer(f)) if f.len() == 2));
    }

    #[tokio::test]
    async fn test_happy_path_records_nothing() {
        let channel = BoundedChannel::new(1);
        let errors = ErrorLog::new();

        let producer = QueuedWorker::spawn("producer", Arc::clone(&channel), errors.clone(), |ch| async move {
            ch.put_messages(chunk_stream(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]))
                .await
        });
        let consumer = QueuedWorker::spawn("consumer", Arc::clone(&channel), errors.clone(), |ch| async move {
            let mut n = 0;
            while ch.recv().await?.is_some() {
                n += 1;
            }
            assert_eq!(n, 2);
            Ok::<(), AgentError>(())
        });

        producer.join().await.unwrap();
        consumer.join().await.unwrap();
        assert!(errors.into_result().is_ok());
    }
}
