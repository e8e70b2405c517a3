//! Custom error types for the backup agent.

use std::fmt;
use thiserror::Error;

/// Exit code for a successful run.
pub const EXIT_OK: i32 = 0;
/// Exit code for bad data or arguments (sysexits `EX_DATAERR`).
pub const EXIT_BAD_DATA: i32 = 65;
/// Exit code for a missing precondition (sysexits `EX_UNAVAILABLE`).
pub const EXIT_UNAVAILABLE: i32 = 69;
/// Exit code for a failed operation (sysexits `EX_SOFTWARE`).
pub const EXIT_FAILED: i32 = 70;

/// Pipeline phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ParentResolution,
    ManifestFetch,
    Stream,
    PostBackup,
    ChainLookup,
    RestorePrepare,
    RestoreLevel(u32),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::ParentResolution => write!(f, "parent resolution"),
            Phase::ManifestFetch => write!(f, "manifest fetch"),
            Phase::Stream => write!(f, "data stream"),
            Phase::PostBackup => write!(f, "post-backup"),
            Phase::ChainLookup => write!(f, "chain lookup"),
            Phase::RestorePrepare => write!(f, "restore preparation"),
            Phase::RestoreLevel(level) => write!(f, "restore of level {}", level),
        }
    }
}

/// A failure recorded by one transfer worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub worker: String,
    pub message: String,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.worker, self.message)
    }
}

fn join_failures(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Policy violation: {0}")]
    Policy(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer failed: {}", join_failures(.0))]
    Transfer(Vec<WorkerFailure>),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    #[error("No backups found for {0}")]
    NoBackups(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed during {phase}: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<AgentError>,
    },
}

impl AgentError {
    /// Wrap this error with the pipeline phase it happened in.
    pub fn in_phase(self, phase: Phase) -> Self {
        AgentError::Phase {
            phase,
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through phase wrappers.
    pub fn root(&self) -> &AgentError {
        match self {
            AgentError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit code the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            AgentError::Config(_) | AgentError::Parse(_) => EXIT_BAD_DATA,
            AgentError::NoBackups(_) | AgentError::NotFound(_) | AgentError::Unavailable(_) => {
                EXIT_UNAVAILABLE
            }
            _ => EXIT_FAILED,
        }
    }
}

impl From<ssh2::Error> for AgentError {
    fn from(e: ssh2::Error) -> Self {
        AgentError::Storage(format!("ssh: {}", e))
    }
}

impl From<suppaftp::FtpError> for AgentError {
    fn from(e: suppaftp::FtpError) -> Self {
        AgentError::Storage(format!("ftp: {}", e))
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(e: tokio::task::JoinError) -> Self {
        AgentError::Engine(format!("task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
