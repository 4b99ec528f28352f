//! Snapshot storage backends.
//!
//! Both backends implement [`SnapshotBackend`]; callers pick one per
//! operation from the configured [`BackendMode`] via [`open`].

pub mod folder;
pub mod history;
pub mod tree;

use crate::config::BackendMode;
use crate::retention::RetentionPolicy;
use crate::snapshot::{CommitOutcome, Snapshot, SnapshotStamp, TreeNode};
use crate::utils::errors::Result;
use std::path::{Path, PathBuf};

pub use folder::FolderBackend;
pub use history::HistoryBackend;

pub trait SnapshotBackend: Send + Sync {
    fn mode(&self) -> BackendMode;

    fn root(&self) -> &Path;

    /// Prepare a snapshot and return the directory the writer fills.
    fn begin_snapshot(&self, stamp: &SnapshotStamp) -> Result<PathBuf>;

    /// Make a filled directory visible as a snapshot.
    fn finish_snapshot(&self, staging: &Path, stamp: &SnapshotStamp) -> Result<CommitOutcome>;

    /// Discard a snapshot that could not be finished.
    fn abort_snapshot(&self, _staging: &Path) {}

    /// All snapshots, newest first.
    fn list(&self) -> Result<Vec<Snapshot>>;

    /// Unified diff of a snapshot against its predecessor.
    fn diff(&self, id: &str, file: Option<&str>) -> Result<String>;

    fn read_file_at(&self, id: &str, file: &str) -> Result<Vec<u8>>;

    /// Sorted slash-separated paths of every file in a snapshot.
    fn list_files(&self, id: &str) -> Result<Vec<String>>;

    fn file_tree(&self, id: &str) -> Result<Vec<TreeNode>>;

    /// Snapshots eligible for retention, newest first.
    fn retention_candidates(&self) -> Result<Vec<Snapshot>> {
        self.list()
    }

    fn delete(&self, snapshot: &Snapshot) -> Result<()>;

    /// Keep the newest `keep` snapshots and delete the rest, best effort.
    fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let candidates = self.retention_candidates()?;
        Ok(RetentionPolicy::new(keep).prune(&candidates, |s| self.delete(s)))
    }
}

/// Open the backend for `mode` rooted at `root`.
pub fn open(mode: BackendMode, root: impl Into<PathBuf>) -> Box<dyn SnapshotBackend> {
    match mode {
        BackendMode::History => Box::new(HistoryBackend::new(root)),
        BackendMode::Folder => Box::new(FolderBackend::new(root)),
    }
}
