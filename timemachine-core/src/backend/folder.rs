//! Timestamped-directory backend.
//!
//! Snapshots live at `YYYY/MM/YYYY-MM-DD-HHMMSS` under the root. They are
//! written into a hidden staging directory first and renamed into place, so
//! the scanner never sees a partial copy.

use crate::backend::{tree::build_tree, SnapshotBackend};
use crate::config::BackendMode;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::scanner::{scan, SnapshotRef};
use crate::snapshot::{
    newest_first, CommitOutcome, Snapshot, SnapshotKind, SnapshotStamp, TreeNode,
};
use crate::utils::errors::{Result, TimeMachineError};
use crate::utils::paths::{normalize_relative, relative_slash};
use similar::TextDiff;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const STAGING_PREFIX: &str = ".partial-";

#[derive(Debug, Clone)]
pub struct FolderBackend {
    root: PathBuf,
}

impl FolderBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn snapshot_dir(&self, id: &str) -> Result<PathBuf> {
        let rel = normalize_relative(id)?;
        let dir = self.root.join(&rel);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(TimeMachineError::RevisionNotFound(id.to_string()))
        }
    }

    /// Predecessor of `id` in newest-first order.
    fn older_than(&self, id: &str) -> Result<Snapshot> {
        let rel = normalize_relative(id)?;
        let snapshots = self.list()?;
        let pos = snapshots
            .iter()
            .position(|s| s.id == rel)
            .ok_or_else(|| TimeMachineError::RevisionNotFound(id.to_string()))?;
        snapshots
            .into_iter()
            .nth(pos + 1)
            .ok_or_else(|| TimeMachineError::NoParentRevision {
                revision: id.to_string(),
            })
    }

    fn read_or_empty(&self, id: &str, file: &str) -> Result<String> {
        match self.read_file_at(id, file) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(TimeMachineError::FileNotFoundAtRevision { .. }) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Remove now-empty month and year directories above a deleted snapshot.
    fn remove_empty_parents(&self, dir: &Path) {
        for parent in dir.ancestors().skip(1) {
            if parent == self.root || !parent.starts_with(&self.root) {
                break;
            }
            if std::fs::remove_dir(parent).is_err() {
                break;
            }
        }
    }
}

fn snapshot_from_ref(r: SnapshotRef) -> Snapshot {
    Snapshot {
        id: r.relative,
        created_at: r.created_at,
        kind: SnapshotKind::Unknown,
        label: r.folder_name,
        tags: Vec::new(),
    }
}

fn unified_diff(file: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{file}"), &format!("b/{file}"))
        .to_string()
}

impl SnapshotBackend for FolderBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Folder
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn begin_snapshot(&self, stamp: &SnapshotStamp) -> Result<PathBuf> {
        let wall = stamp.wall_clock()?;
        let parent = self.root.join(wall.format("%Y/%m").to_string());
        std::fs::create_dir_all(&parent)?;

        let staging = parent.join(format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir(&staging)?;
        tracing::debug!(staging = %staging.display(), "Snapshot staging directory created");
        Ok(staging)
    }

    fn finish_snapshot(&self, staging: &Path, stamp: &SnapshotStamp) -> Result<CommitOutcome> {
        let wall = stamp.wall_clock()?;
        let base = wall.format("%Y-%m-%d-%H%M%S").to_string();
        let parent = staging
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let mut target = parent.join(&base);
        let mut n = 2;
        while target.exists() {
            target = parent.join(format!("{base}-{n}"));
            n += 1;
        }

        std::fs::rename(staging, &target)?;
        let folder_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| base.clone());
        let relative = relative_slash(&self.root, &target).unwrap_or_else(|| folder_name.clone());

        tracing::info!(path = %target.display(), "Snapshot folder created");
        Ok(CommitOutcome::Created(Snapshot {
            id: relative,
            created_at: wall.and_utc(),
            kind: SnapshotKind::Unknown,
            label: folder_name,
            tags: Vec::new(),
        }))
    }

    fn abort_snapshot(&self, staging: &Path) {
        if let Err(e) = std::fs::remove_dir_all(staging) {
            tracing::warn!(staging = %staging.display(), error = %e, "Failed to remove staging directory");
        }
    }

    fn list(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = scan(&self.root)?
            .into_iter()
            .map(snapshot_from_ref)
            .collect();
        snapshots.sort_by(newest_first);
        Ok(snapshots)
    }

    fn diff(&self, id: &str, file: Option<&str>) -> Result<String> {
        let older = self.older_than(id)?;

        let files: BTreeSet<String> = match file {
            Some(f) => std::iter::once(normalize_relative(f)?).collect(),
            None => self
                .list_files(id)?
                .into_iter()
                .chain(self.list_files(&older.id)?)
                .collect(),
        };

        let mut patch = String::new();
        for f in files {
            let old = self.read_or_empty(&older.id, &f)?;
            let new = self.read_or_empty(id, &f)?;
            if old != new {
                patch.push_str(&unified_diff(&f, &old, &new));
            }
        }
        Ok(patch)
    }

    fn read_file_at(&self, id: &str, file: &str) -> Result<Vec<u8>> {
        let dir = self.snapshot_dir(id)?;
        let rel = normalize_relative(file)?;
        let path = dir.join(&rel);
        if !path.is_file() {
            return Err(TimeMachineError::FileNotFoundAtRevision {
                revision: id.to_string(),
                path: rel,
            });
        }
        Ok(std::fs::read(path)?)
    }

    fn list_files(&self, id: &str) -> Result<Vec<String>> {
        let dir = self.snapshot_dir(id)?;
        let options = WalkOptions {
            skip_hidden: false,
            yaml_only: false,
        };
        Ok(walk_directory(&dir, &options)?
            .into_iter()
            .filter_map(|f| relative_slash(&dir, &f.path))
            .collect())
    }

    fn file_tree(&self, id: &str) -> Result<Vec<TreeNode>> {
        let present: BTreeSet<String> = self.list_files(id)?.into_iter().collect();
        Ok(build_tree(&present, &BTreeSet::new()))
    }

    fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.snapshot_dir(&snapshot.id)?;
        std::fs::remove_dir_all(&dir)?;
        self.remove_empty_parents(&dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Trigger;
    use chrono::{Duration, TimeZone, Utc};
    use std::fs;
    use tempfile::TempDir;

    fn stamp(offset_secs: i64) -> SnapshotStamp {
        SnapshotStamp {
            trigger: Trigger::Scheduled,
            at: Utc.with_ymd_and_hms(2025, 6, 2, 15, 30, 45).unwrap() + Duration::seconds(offset_secs),
            timezone: Some("UTC".into()),
        }
    }

    fn write_snapshot(backend: &FolderBackend, offset: i64, files: &[(&str, &str)]) -> Snapshot {
        let s = stamp(offset);
        let staging = backend.begin_snapshot(&s).unwrap();
        for (name, content) in files {
            let path = staging.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        backend
            .finish_snapshot(&staging, &s)
            .unwrap()
            .snapshot()
            .unwrap()
            .clone()
    }

    #[test]
    fn test_snapshot_layout_and_collision() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path());

        let first = write_snapshot(&backend, 0, &[("automations.yaml", "[]\n")]);
        assert_eq!(first.id, "2025/06/2025-06-02-153045");

        let second = write_snapshot(&backend, 0, &[("automations.yaml", "[]\n")]);
        assert_eq!(second.id, "2025/06/2025-06-02-153045-2");

        let entries: Vec<_> = fs::read_dir(temp_dir.path().join("2025/06"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(!entries.iter().any(|e| e.starts_with(STAGING_PREFIX)));
    }

    #[test]
    fn test_staging_is_invisible_to_list() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path());
        write_snapshot(&backend, 0, &[("a.yaml", "a: 1\n")]);

        let staging = backend.begin_snapshot(&stamp(60)).unwrap();
        fs::write(staging.join("a.yaml"), "a: 2\n").unwrap();
        assert_eq!(backend.list().unwrap().len(), 1);

        backend.abort_snapshot(&staging);
        assert!(!staging.exists());
    }

    #[test]
    fn test_diff_against_previous() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path());
        let old = write_snapshot(&backend, 0, &[("scripts.yaml", "a: 1\n")]);
        let new = write_snapshot(&backend, 60, &[("scripts.yaml", "a: 2\n"), ("new.yaml", "n: 1\n")]);

        let patch = backend.diff(&new.id, None).unwrap();
        assert!(patch.contains("-a: 1"));
        assert!(patch.contains("+a: 2"));
        assert!(patch.contains("+++ b/new.yaml"));

        let err = backend.diff(&old.id, None).unwrap_err();
        assert!(matches!(err, TimeMachineError::NoParentRevision { .. }));
    }

    #[test]
    fn test_read_and_list_include_storage() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path());
        let snap = write_snapshot(
            &backend,
            0,
            &[("automations.yaml", "[]\n"), (".storage/lovelace", "{}")],
        );

        assert_eq!(
            backend.list_files(&snap.id).unwrap(),
            vec![".storage/lovelace", "automations.yaml"]
        );
        assert_eq!(backend.read_file_at(&snap.id, ".storage/lovelace").unwrap(), b"{}");
        assert!(matches!(
            backend.read_file_at(&snap.id, "nope.yaml").unwrap_err(),
            TimeMachineError::FileNotFoundAtRevision { .. }
        ));
        assert!(backend.read_file_at(&snap.id, "../../etc/passwd").is_err());
    }

    #[test]
    fn test_prune_removes_empty_parents() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path());
        write_snapshot(&backend, 0, &[("a.yaml", "a: 1\n")]);
        write_snapshot(&backend, 60 * 60 * 24 * 40, &[("a.yaml", "a: 2\n")]);

        let deleted = backend.prune(1).unwrap();
        assert_eq!(deleted, vec!["2025/06/2025-06-02-153045".to_string()]);
        assert!(!temp_dir.path().join("2025/06").exists());
        assert_eq!(backend.list().unwrap().len(), 1);
    }
}
