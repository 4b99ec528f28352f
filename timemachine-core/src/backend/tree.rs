//! Hierarchical file trees for the snapshot browser.

use crate::snapshot::{NodeKind, TreeNode};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
struct DirBuilder {
    dirs: BTreeMap<String, DirBuilder>,
    files: BTreeMap<String, bool>,
}

impl DirBuilder {
    fn insert(&mut self, path: &str, deleted: bool) {
        let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
        let mut dir = self;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                dir.files.entry(part.to_string()).or_insert(deleted);
            } else {
                dir = dir.dirs.entry(part.to_string()).or_default();
            }
        }
    }

    fn into_nodes(self, prefix: &str) -> Vec<TreeNode> {
        let mut nodes = Vec::with_capacity(self.dirs.len() + self.files.len());

        for (name, dir) in self.dirs {
            let path = join(prefix, &name);
            let children = dir.into_nodes(&path);
            let deleted = !children.is_empty() && children.iter().all(|c| c.deleted);
            nodes.push(TreeNode {
                name,
                path,
                kind: NodeKind::Dir,
                deleted,
                children,
            });
        }

        for (name, deleted) in self.files {
            nodes.push(TreeNode {
                path: join(prefix, &name),
                name,
                kind: NodeKind::File,
                deleted,
                children: Vec::new(),
            });
        }

        nodes
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Build a tree from slash-separated paths, directories first then by name.
///
/// Paths in `historical` that are not in `present` are marked deleted.
pub fn build_tree(present: &BTreeSet<String>, historical: &BTreeSet<String>) -> Vec<TreeNode> {
    let mut root = DirBuilder::default();
    for path in present {
        root.insert(path, false);
    }
    for path in historical.difference(present) {
        root.insert(path, true);
    }
    root.into_nodes("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_dirs_first_then_alphabetical() {
        let tree = build_tree(
            &set(&["scripts.yaml", "automations.yaml", "esphome/b.yaml", "esphome/a.yaml"]),
            &BTreeSet::new(),
        );
        let names: Vec<_> = tree.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["esphome", "automations.yaml", "scripts.yaml"]);
        assert_eq!(tree[0].children[0].path, "esphome/a.yaml");
    }

    #[test]
    fn test_deleted_annotation() {
        let tree = build_tree(
            &set(&["automations.yaml"]),
            &set(&["automations.yaml", "old.yaml", "packages/gone.yaml"]),
        );
        let packages = tree.iter().find(|n| n.name == "packages").unwrap();
        assert!(packages.deleted);
        assert!(packages.children[0].deleted);
        let old = tree.iter().find(|n| n.name == "old.yaml").unwrap();
        assert!(old.deleted);
        let live = tree.iter().find(|n| n.name == "automations.yaml").unwrap();
        assert!(!live.deleted);
    }
}
