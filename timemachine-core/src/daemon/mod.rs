//! Process lifecycle helpers for long-running binaries.

pub mod shutdown;

pub use shutdown::ShutdownCoordinator;
