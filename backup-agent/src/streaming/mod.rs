//! Producer/consumer plumbing between engines and storages.

pub mod channel;
pub mod fanout;
pub mod throttle;
pub mod worker;

pub use channel::{chunk_stream, rechunk, BoundedChannel, ChunkStream, Recv, DEFAULT_CAPACITY, POLL_INTERVAL};
pub use fanout::FanOut;
pub use throttle::{throttle, TokenBucket};
pub use worker::{ErrorLog, QueuedWorker};
