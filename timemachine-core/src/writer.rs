//! Copies the live configuration into a backend and finalizes a snapshot.

use crate::backend::SnapshotBackend;
use crate::config::{FeatureConfig, Settings};
use crate::fs::walker::list_yaml_files_recursive;
use crate::snapshot::{CommitOutcome, SnapshotStamp, Trigger};
use crate::utils::errors::{Result, TimeMachineError};
use crate::utils::paths::{is_yaml, relative_slash};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Optional subtrees included in a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// ESPHome device definitions under `esphome/`
    pub device_definitions: bool,
    /// User packages under `packages/`
    pub user_packages: bool,
}

impl From<&FeatureConfig> for Capabilities {
    fn from(features: &FeatureConfig) -> Self {
        Self {
            device_definitions: features.esphome,
            user_packages: features.packages,
        }
    }
}

/// One writer at a time per backup root within this process.
#[derive(Debug, Clone, Default)]
pub struct WriteLocks {
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl WriteLocks {
    pub fn global() -> &'static WriteLocks {
        static LOCKS: OnceLock<WriteLocks> = OnceLock::new();
        LOCKS.get_or_init(WriteLocks::default)
    }

    pub fn lock_for(&self, root: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteReport {
    pub outcome: CommitOutcome,
    pub copied: usize,
    /// Files that could not be copied; logged and skipped
    pub failed: usize,
    pub pruned: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    capabilities: Capabilities,
    /// Snapshots to keep after each write; `None` disables retention
    retention: Option<usize>,
    locks: WriteLocks,
}

impl SnapshotWriter {
    pub fn new(capabilities: Capabilities, retention: Option<usize>) -> Self {
        Self {
            capabilities,
            retention: retention.filter(|keep| *keep > 0),
            locks: WriteLocks::global().clone(),
        }
    }

    /// Capabilities and retention from a settings snapshot.
    pub fn from_settings(settings: &Settings) -> Self {
        let retention = settings
            .backup
            .max_backups_enabled
            .then_some(settings.backup.max_backups_count);
        Self::new(Capabilities::from(&settings.features), retention)
    }

    pub fn with_retention(mut self, retention: Option<usize>) -> Self {
        self.retention = retention.filter(|keep| *keep > 0);
        self
    }

    pub fn with_locks(mut self, locks: WriteLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Copy the live tree at `source` into `backend` as one snapshot.
    pub fn write(
        &self,
        backend: &dyn SnapshotBackend,
        source: &Path,
        trigger: Trigger,
        timezone: Option<String>,
    ) -> Result<WriteReport> {
        self.write_stamped(backend, source, SnapshotStamp::now(trigger, timezone))
    }

    /// [`write`](Self::write) with an explicit clock reading.
    pub fn write_stamped(
        &self,
        backend: &dyn SnapshotBackend,
        source: &Path,
        stamp: SnapshotStamp,
    ) -> Result<WriteReport> {
        if !source.is_dir() {
            return Err(TimeMachineError::not_found("live configuration directory", source));
        }
        stamp.wall_clock()?;

        let plan = copy_plan(source, self.capabilities);
        tracing::info!(
            source = %source.display(),
            root = %backend.root().display(),
            files = plan.len(),
            kind = %stamp.kind(),
            "Starting snapshot"
        );

        self.commit(backend, &stamp, &plan)
    }

    /// Copy one changed file into `backend` at its path relative to `live_root`.
    pub fn write_file(
        &self,
        backend: &dyn SnapshotBackend,
        live_root: &Path,
        changed: &Path,
    ) -> Result<WriteReport> {
        let rel = relative_slash(live_root, changed).ok_or_else(|| {
            TimeMachineError::InvalidInput(format!(
                "{} is outside {}",
                changed.display(),
                live_root.display()
            ))
        })?;
        if !changed.is_file() {
            return Err(TimeMachineError::not_found("changed file", changed));
        }

        let stamp = SnapshotStamp::now(Trigger::Autosave(rel.clone()), None);
        self.commit(backend, &stamp, &[(changed.to_path_buf(), rel)])
    }

    fn commit(
        &self,
        backend: &dyn SnapshotBackend,
        stamp: &SnapshotStamp,
        plan: &[(PathBuf, String)],
    ) -> Result<WriteReport> {
        let root = backend.root().to_path_buf();
        preflight(&root)?;

        let lock = self.locks.lock_for(&root);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let staging = backend.begin_snapshot(stamp).map_err(|e| match e {
            TimeMachineError::Io(source) => TimeMachineError::CreateFailed {
                path: root.clone(),
                parent: root.parent().map(Path::to_path_buf).unwrap_or_default(),
                source,
            },
            other => other,
        })?;

        let (copied, failed) = copy_files(plan, &staging);
        if failed > 0 {
            tracing::warn!(copied, failed, "Some files could not be copied");
        }

        let outcome = match backend.finish_snapshot(&staging, stamp) {
            Ok(outcome) => outcome,
            Err(e) => {
                backend.abort_snapshot(&staging);
                return Err(e);
            }
        };

        let pruned = match self.retention {
            Some(keep) => backend.prune(keep).unwrap_or_else(|e| {
                tracing::warn!(root = %root.display(), error = %e, "Retention failed");
                Vec::new()
            }),
            None => Vec::new(),
        };

        Ok(WriteReport {
            outcome,
            copied,
            failed,
            pruned,
        })
    }
}

/// Name prefix of the throwaway file `preflight` creates. Ignored by history commits.
pub const WRITE_CHECK_PREFIX: &str = ".write-check-";

/// Ensure the backup root exists and is readable and writable.
pub fn preflight(root: &Path) -> Result<()> {
    if root.exists() {
        let denied = |_| TimeMachineError::PermissionDenied {
            path: root.to_path_buf(),
        };
        std::fs::read_dir(root).map_err(denied)?;

        let marker = root.join(format!("{}{}", WRITE_CHECK_PREFIX, uuid::Uuid::new_v4().simple()));
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .map_err(denied)?;
        if let Err(e) = std::fs::remove_file(&marker) {
            tracing::warn!(path = %marker.display(), error = %e, "Failed to remove write-check file");
        }
        return Ok(());
    }

    std::fs::create_dir_all(root).map_err(|source| TimeMachineError::CreateFailed {
        path: root.to_path_buf(),
        parent: root.parent().map(Path::to_path_buf).unwrap_or_default(),
        source,
    })?;
    tracing::info!(root = %root.display(), "Backup root did not exist, created it");
    Ok(())
}

/// Files to copy, as (source path, snapshot-relative path), in copy order.
pub fn copy_plan(source: &Path, capabilities: Capabilities) -> Vec<(PathBuf, String)> {
    let mut plan = Vec::new();

    plan.extend(top_level_files(source, |name| is_yaml(Path::new(name))));
    plan.extend(
        top_level_files(&source.join(".storage"), |name| name.starts_with("lovelace"))
            .into_iter()
            .map(|(path, name)| (path, format!(".storage/{name}"))),
    );

    let subtrees = [
        ("esphome", capabilities.device_definitions),
        ("packages", capabilities.user_packages),
    ];
    for (dir, enabled) in subtrees {
        if !enabled {
            continue;
        }
        match list_yaml_files_recursive(&source.join(dir)) {
            Ok(files) => plan.extend(files.into_iter().filter_map(|f| {
                let rel = relative_slash(&source.join(dir), &f.path)?;
                Some((f.path, format!("{dir}/{rel}")))
            })),
            Err(e) => tracing::warn!(dir, error = %e, "Failed to list subtree"),
        }
    }

    plan
}

/// Regular files directly inside `dir` whose names pass `filter`, sorted.
fn top_level_files(dir: &Path, filter: impl Fn(&str) -> bool) -> Vec<(PathBuf, String)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to read directory");
            return Vec::new();
        }
    };

    let mut files: Vec<(PathBuf, String)> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| (e.path(), e.file_name().to_string_lossy().to_string()))
        .filter(|(_, name)| filter(name))
        .collect();
    files.sort_by(|a, b| a.1.cmp(&b.1));
    files
}

fn copy_files(plan: &[(PathBuf, String)], staging: &Path) -> (usize, usize) {
    let mut copied = 0;
    let mut failed = 0;
    for (src, rel) in plan {
        let dest = staging.join(rel);
        let result = match dest.parent() {
            Some(parent) => std::fs::create_dir_all(parent),
            None => Ok(()),
        }
        .and_then(|_| std::fs::copy(src, &dest));

        match result {
            Ok(_) => copied += 1,
            Err(e) => {
                tracing::warn!(file = %rel, error = %e, "Failed to copy file");
                failed += 1;
            }
        }
    }
    (copied, failed)
}
