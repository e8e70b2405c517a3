//! Process lifecycle: signal handling for in-flight operations.

pub mod shutdown;

pub use shutdown::ShutdownCoordinator;
