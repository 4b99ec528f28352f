//! Path helpers shared by the backends and the restore workflow.

use crate::utils::errors::{Result, TimeMachineError};
use std::path::{Component, Path, PathBuf};

/// Validate a user-supplied relative path and join it onto `base`.
///
/// Rejects empty paths, absolute paths and any `..` component, so the
/// result always stays strictly inside `base`.
pub fn resolve_within(base: &Path, relative: &str) -> Result<PathBuf> {
    let rel = normalize_relative(relative)?;
    Ok(base.join(rel))
}

/// Normalize a user-supplied relative path to forward-slash form.
pub fn normalize_relative(relative: &str) -> Result<String> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(TimeMachineError::InvalidInput("empty path".into()));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TimeMachineError::InvalidInput(format!(
                    "path escapes its base directory: {trimmed}"
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(TimeMachineError::InvalidInput(format!("invalid path: {trimmed}")));
    }
    Ok(parts.join("/"))
}

/// Root-relative path rendered with forward slashes.
pub fn relative_slash(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

pub fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_within_accepts_nested_paths() {
        let resolved = resolve_within(Path::new("/config/esphome"), "living/room.yaml").unwrap();
        assert_eq!(resolved, PathBuf::from("/config/esphome/living/room.yaml"));
    }

    #[test]
    fn test_resolve_within_rejects_traversal() {
        assert!(resolve_within(Path::new("/config"), "../etc/passwd").is_err());
        assert!(resolve_within(Path::new("/config"), "a/../../b").is_err());
        assert!(resolve_within(Path::new("/config"), "/etc/passwd").is_err());
        assert!(resolve_within(Path::new("/config"), "   ").is_err());
        assert!(resolve_within(Path::new("/config"), ".").is_err());
    }

    #[test]
    fn test_normalize_relative_strips_cur_dir() {
        assert_eq!(normalize_relative("./packages/x.yaml").unwrap(), "packages/x.yaml");
    }

    #[test]
    fn test_is_yaml() {
        assert!(is_yaml(Path::new("automations.yaml")));
        assert!(is_yaml(Path::new("x.YML")));
        assert!(!is_yaml(Path::new("lovelace")));
        assert!(!is_yaml(Path::new("home-assistant.log")));
    }
}
