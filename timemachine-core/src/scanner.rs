//! Discovery of snapshot directories under a backup root.

use crate::utils::errors::{Result, TimeMachineError};
use crate::utils::paths::{is_hidden, relative_slash};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Directory names that never hold snapshots.
pub const SKIP_DIRS: [&str; 3] = ["esphome", ".storage", "packages"];

/// A snapshot directory found by [`scan`].
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRef {
    pub path: PathBuf,
    /// Root-relative, forward-slash form (the folder snapshot id)
    pub relative: String,
    pub folder_name: String,
    pub created_at: DateTime<Utc>,
}

/// `YYYY-MM-DD-HHMMSS`
pub fn is_dashed_name(name: &str) -> bool {
    matches_shape(name, "dddd-dd-dd-dddddd")
}

/// `YYYYMMDDHHMM`
pub fn is_numeric_name(name: &str) -> bool {
    matches_shape(name, "dddddddddddd")
}

fn matches_shape(name: &str, shape: &str) -> bool {
    name.len() == shape.len()
        && name.bytes().zip(shape.bytes()).all(|(c, s)| match s {
            b'd' => c.is_ascii_digit(),
            other => c == other,
        })
}

/// Wall-clock time encoded in a snapshot folder name.
///
/// Accepts a `-N` collision suffix after the dashed form.
pub fn parse_folder_timestamp(name: &str) -> Option<NaiveDateTime> {
    if is_numeric_name(name) {
        return NaiveDateTime::parse_from_str(name, "%Y%m%d%H%M").ok();
    }
    let head = name.get(..17)?;
    if !is_dashed_name(head) {
        return None;
    }
    let tail = &name[17..];
    let suffix_ok = tail.is_empty()
        || (tail.len() > 1
            && tail.starts_with('-')
            && tail[1..].bytes().all(|c| c.is_ascii_digit()));
    if !suffix_ok {
        return None;
    }
    NaiveDateTime::parse_from_str(head, "%Y-%m-%d-%H%M%S").ok()
}

/// Whether a directory is a snapshot: by name, or by holding YAML files.
pub fn is_snapshot_dir(path: &Path, name: &str) -> bool {
    if is_dashed_name(name) || is_numeric_name(name) || parse_folder_timestamp(name).is_some() {
        return true;
    }
    match std::fs::read_dir(path) {
        Ok(entries) => entries.flatten().any(|entry| {
            let file = entry.file_name().to_string_lossy().to_string();
            file.ends_with(".yaml")
                || file.ends_with(".yml")
                || file == "automations.yaml"
                || file == "scripts.yaml"
        }),
        Err(_) => false,
    }
}

/// Recursively discover snapshot directories under `root`.
///
/// Matched directories are still descended into. Unreadable subdirectories
/// are logged and skipped. The result is in discovery order; sort it with
/// [`crate::snapshot::newest_first`] after conversion.
pub fn scan(root: &Path) -> Result<Vec<SnapshotRef>> {
    if !root.is_dir() {
        return Err(TimeMachineError::not_found("backup root", root));
    }

    let mut results = Vec::new();
    scan_dir(root, root, &mut results)?;
    results.retain(|r| !SKIP_DIRS.contains(&r.folder_name.as_str()));
    Ok(results)
}

fn scan_dir(root: &Path, dir: &Path, results: &mut Vec<SnapshotRef>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if dir == root => return Err(e.into()),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
            return Ok(());
        }
    };

    let mut dirs: Vec<(PathBuf, String)> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| (e.path(), e.file_name().to_string_lossy().to_string()))
        .filter(|(_, name)| !is_hidden(name) && !SKIP_DIRS.contains(&name.as_str()))
        .collect();
    dirs.sort_by(|a, b| a.1.cmp(&b.1));

    for (path, name) in dirs {
        if is_snapshot_dir(&path, &name) {
            let relative = relative_slash(root, &path).unwrap_or_else(|| name.clone());
            results.push(SnapshotRef {
                created_at: folder_created_at(&path, &name),
                path: path.clone(),
                relative,
                folder_name: name,
            });
        }
        scan_dir(root, &path, results)?;
    }

    Ok(())
}

/// Folder names carry wall-clock time without an offset; they are read as UTC.
fn folder_created_at(path: &Path, name: &str) -> DateTime<Utc> {
    if let Some(naive) = parse_folder_timestamp(name) {
        return naive.and_utc();
    }
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}
