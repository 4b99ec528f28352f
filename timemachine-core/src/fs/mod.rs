//! Filesystem traversal.

pub mod walker;

pub use walker::{list_yaml_files_recursive, walk_directory, FileInfo, WalkOptions};
