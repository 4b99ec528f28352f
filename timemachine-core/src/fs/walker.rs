//! Directory traversal for configuration subtrees.
//!
//! Symlinks are never followed and hidden entries are pruned before
//! descending, so a walk only ever sees regular files inside the subtree.

use crate::utils::paths::{is_hidden, is_yaml};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Skip dotfiles and dot-directories
    pub skip_hidden: bool,

    /// Only report YAML files
    pub yaml_only: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            skip_hidden: true,
            yaml_only: true,
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,
}

/// Walk a directory tree and collect matching files, sorted by relative path.
///
/// A missing root yields an empty list.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let entries = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(options.skip_hidden && entry_is_hidden(e)));

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        // Symlinks and directories are never copied
        if !entry.file_type().is_file() {
            continue;
        }
        if options.yaml_only && !is_yaml(entry.path()) {
            continue;
        }

        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        files.push(FileInfo { path, relative_path });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// All YAML files below `root`, recursively, skipping dotfiles and symlinks.
pub fn list_yaml_files_recursive(root: &Path) -> std::io::Result<Vec<FileInfo>> {
    walk_directory(root, &WalkOptions::default())
}

fn entry_is_hidden(entry: &DirEntry) -> bool {
    is_hidden(&entry.file_name().to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_missing_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = list_yaml_files_recursive(&temp_dir.path().join("esphome"))?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_yaml_only_sorted() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("zeta.yaml"), b"a: 1")?;
        fs::write(temp_dir.path().join("alpha.yml"), b"a: 1")?;
        fs::write(temp_dir.path().join("notes.txt"), b"skip")?;
        fs::write(temp_dir.path().join("sub/node.yaml"), b"a: 1")?;

        let files = list_yaml_files_recursive(temp_dir.path())?;
        let names: Vec<_> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["alpha.yml", "sub/node.yaml", "zeta.yaml"]);

        Ok(())
    }

    #[test]
    fn test_hidden_entries_are_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join(".esphome"))?;
        fs::write(temp_dir.path().join(".esphome/build.yaml"), b"x")?;
        fs::write(temp_dir.path().join(".secret.yaml"), b"x")?;
        fs::write(temp_dir.path().join("device.yaml"), b"x")?;

        let files = list_yaml_files_recursive(temp_dir.path())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path.to_str().unwrap(), "device.yaml");

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let outside = TempDir::new()?;

        fs::write(outside.path().join("leak.yaml"), b"x")?;
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("linked"))?;
        std::os::unix::fs::symlink(
            outside.path().join("leak.yaml"),
            temp_dir.path().join("alias.yaml"),
        )?;

        let files = list_yaml_files_recursive(temp_dir.path())?;
        assert!(files.is_empty());

        Ok(())
    }
}
