//! Chain Backup Agent Library
//!
//! Streaming backup agent building incremental chains (level 0 plus
//! increments) on pluggable storages, with archive and cloud-resource engines.

pub mod chain;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod executor;
pub mod storage;
pub mod streaming;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use chain::{Backup, BackupId, IncrementalPolicy};
pub use config::Config;
pub use engine::BackupEngine;
pub use executor::{BackupExecutor, BackupRequest, RestoreRequest};
pub use storage::Storage;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
