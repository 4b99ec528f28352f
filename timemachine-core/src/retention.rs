//! Retention: keep the newest N snapshots and delete the rest.

use crate::snapshot::{newest_first, Snapshot};

/// Count-based retention over a set of snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep: usize,
}

impl RetentionPolicy {
    pub fn new(keep: usize) -> Self {
        Self { keep }
    }

    /// Snapshots to delete, newest-first. Does not touch storage.
    ///
    /// The result depends only on the set, never on input order.
    pub fn plan(&self, snapshots: &[Snapshot]) -> Vec<Snapshot> {
        if snapshots.len() <= self.keep {
            return Vec::new();
        }
        let mut sorted = snapshots.to_vec();
        sorted.sort_by(newest_first);
        sorted.split_off(self.keep)
    }

    /// Delete everything beyond the newest `keep`, one entry at a time.
    ///
    /// A failed deletion is logged and the batch continues. Returns the ids
    /// that were actually deleted.
    pub fn prune<F, E>(&self, snapshots: &[Snapshot], mut delete: F) -> Vec<String>
    where
        F: FnMut(&Snapshot) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        let mut deleted = Vec::new();
        for snapshot in self.plan(snapshots) {
            match delete(&snapshot) {
                Ok(()) => {
                    tracing::info!(id = %snapshot.id, created_at = %snapshot.created_at, "Deleted old snapshot");
                    deleted.push(snapshot.id);
                }
                Err(e) => {
                    tracing::warn!(id = %snapshot.id, error = %e, "Failed to delete old snapshot");
                }
            }
        }
        deleted
    }
}
