//! Utility modules for the backup engine.

pub mod errors;
pub mod logger;
pub mod paths;

pub use errors::{ErrorKind, Result, TimeMachineError};
