//! Utility modules for the backup agent.

pub mod errors;
pub mod logger;
pub mod time;
pub mod wait;

pub use errors::{AgentError, Phase, Result, WorkerFailure};
pub use time::{days_before, days_to_seconds, now_timestamp, parse_timestamp};
pub use wait::wait_for;
