//! Error taxonomy for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimeMachineError {
    #[error("Not found: {what} ({})", path.display())]
    NotFound { what: String, path: PathBuf },

    #[error("Backup directory is not writable: {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("Failed to create backup directory {} (parent: {}): {source}", path.display(), parent.display())]
    CreateFailed {
        path: PathBuf,
        parent: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("History store is not initialized at {}", root.display())]
    BackendUninitialized { root: PathBuf },

    #[error("Revision {revision} has no parent revision")]
    NoParentRevision { revision: String },

    #[error("File {path} does not exist at revision {revision}")]
    FileNotFoundAtRevision { revision: String, path: String },

    #[error("Unknown revision: {0}")]
    RevisionNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History store error: {0}")]
    Git(#[from] git2::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification used by the CLI exit codes and the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    CreateFailed,
    InvalidInput,
    BackendUninitialized,
    Internal,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::NotFound => 2,
            ErrorKind::PermissionDenied => 3,
            ErrorKind::CreateFailed => 4,
            ErrorKind::InvalidInput => 5,
            ErrorKind::BackendUninitialized => 6,
        }
    }
}

impl TimeMachineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TimeMachineError::NotFound { .. }
            | TimeMachineError::FileNotFoundAtRevision { .. }
            | TimeMachineError::RevisionNotFound(_) => ErrorKind::NotFound,
            TimeMachineError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            TimeMachineError::CreateFailed { .. } => ErrorKind::CreateFailed,
            TimeMachineError::InvalidInput(_)
            | TimeMachineError::InvalidSchedule { .. }
            | TimeMachineError::NoParentRevision { .. } => ErrorKind::InvalidInput,
            TimeMachineError::BackendUninitialized { .. } => ErrorKind::BackendUninitialized,
            TimeMachineError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            TimeMachineError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::PermissionDenied
            }
            _ => ErrorKind::Internal,
        }
    }

    pub fn not_found(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        TimeMachineError::NotFound {
            what: what.into(),
            path: path.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TimeMachineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = TimeMachineError::not_found("backup root", "/media/timemachine");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.kind().exit_code(), 2);

        let err = TimeMachineError::InvalidSchedule {
            expression: "61 * * * *".into(),
            reason: "minute out of range".into(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = TimeMachineError::BackendUninitialized { root: "/tmp/x".into() };
        assert_eq!(err.kind().exit_code(), 6);
    }

    #[test]
    fn test_io_errors_are_classified() {
        let err: TimeMachineError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err: TimeMachineError = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_create_failed_message_carries_parent() {
        let err = TimeMachineError::CreateFailed {
            path: "/media/tm/2025/06/2025-06-02-153045".into(),
            parent: "/media/tm".into(),
            source: std::io::Error::other("read-only file system"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/media/tm/2025/06"));
        assert!(msg.contains("parent: /media/tm"));
    }
}
