//! Config Time Machine core library
//!
//! Versioned backups of a home-automation YAML configuration tree, stored
//! either as git revision history or as timestamped folder copies.

pub mod backend;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod restore;
pub mod retention;
pub mod scanner;
pub mod schedule;
pub mod snapshot;
pub mod utils;
pub mod watcher;
pub mod writer;

// Re-export commonly used types
pub use backend::{FolderBackend, HistoryBackend, SnapshotBackend};
pub use config::{BackendMode, ConfigLoader, Settings};
pub use snapshot::{CommitOutcome, Snapshot, SnapshotKind, Trigger};
pub use utils::errors::{ErrorKind, Result, TimeMachineError};
