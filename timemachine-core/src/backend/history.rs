//! Revision-history backend built on a git repository at the backup root.
//!
//! The backup root is the working tree. Each snapshot is one commit holding
//! every staged change, tagged by trigger kind so retention can find it.

use crate::backend::{tree::build_tree, SnapshotBackend};
use crate::config::BackendMode;
use crate::retention::RetentionPolicy;
use crate::scanner::{is_dashed_name, is_numeric_name};
use crate::snapshot::{
    CommitOutcome, RepoStats, Snapshot, SnapshotKind, SnapshotStamp, TreeNode,
};
use crate::utils::errors::{Result, TimeMachineError};
use crate::utils::paths::normalize_relative;
use chrono::{DateTime, Utc};
use git2::{
    Commit, DiffFormat, DiffOptions, ErrorCode, IndexAddOption, ObjectType, Oid, Repository,
    Signature, StatusOptions, Tree, TreeWalkMode, TreeWalkResult,
};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

const IDENTITY_NAME: &str = "HA Time Machine";
const IDENTITY_EMAIL: &str = "addon@homeassistant.local";
const INITIAL_MESSAGE: &str = "Initial commit: Git-based backup initialized";
const MIGRATION_MESSAGE: &str = "Migrate legacy backup folders out of history";
const MIGRATION_BATCH: usize = 100;

const GITIGNORE: &str = "\
# Home Assistant logs and databases
home-assistant.log
*.log
*.db
*.db-journal
*.db-shm
*.db-wal
__pycache__/
.write-check-*
*.pyc
*.pyo

# Temporary files
.DS_Store
Thumbs.db

# Secrets (additional protection)
secrets.yaml
.HA_VERSION
.uuid
.cloud
.storage/auth*
";

#[derive(Debug, Clone)]
pub struct HistoryBackend {
    root: PathBuf,
}

impl HistoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn is_initialized(&self) -> bool {
        self.root.join(".git").exists()
    }

    /// Create the repository with its ignore file and initial revision.
    ///
    /// Returns `false` when the repository already existed.
    pub fn init(&self) -> Result<bool> {
        if self.is_initialized() {
            tracing::debug!(root = %self.root.display(), "History store already initialized");
            return Ok(false);
        }

        std::fs::create_dir_all(&self.root)?;
        let repo = Repository::init(&self.root)?;
        {
            let mut config = repo.config()?;
            config.set_str("user.name", IDENTITY_NAME)?;
            config.set_str("user.email", IDENTITY_EMAIL)?;
        }

        let gitignore = self.root.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, GITIGNORE)?;
        }

        let mut index = repo.index()?;
        index.add_path(Path::new(".gitignore"))?;
        index.write()?;
        commit_index(&repo, &mut index, INITIAL_MESSAGE, Utc::now())?;

        tracing::info!(root = %self.root.display(), "History store initialized");
        Ok(true)
    }

    fn open_repo(&self) -> Result<Repository> {
        Repository::open(&self.root).map_err(|e| match e.code() {
            ErrorCode::NotFound => TimeMachineError::BackendUninitialized {
                root: self.root.clone(),
            },
            _ => TimeMachineError::Git(e),
        })
    }

    /// Stage every change under the root and commit it as one revision.
    pub fn commit_all(&self, stamp: &SnapshotStamp) -> Result<CommitOutcome> {
        let repo = self.open_repo()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let head_tree = repo.head().ok().and_then(|h| h.peel_to_tree().ok());
        if head_tree.map(|t| t.id()) == Some(tree_id) {
            tracing::info!(root = %self.root.display(), "No changes detected, skipping snapshot");
            return Ok(CommitOutcome::NoChanges);
        }

        let message = stamp.message();
        let oid = commit_index(&repo, &mut index, &message, stamp.at)?;
        let tag = self.tag_commit(&repo, oid, &stamp.tag_name())?;

        tracing::info!(commit = %oid, tag = %tag, kind = %stamp.kind(), "Snapshot committed");
        Ok(CommitOutcome::Created(Snapshot {
            id: oid.to_string(),
            created_at: stamp.at,
            kind: stamp.kind(),
            label: message,
            tags: vec![tag],
        }))
    }

    fn tag_commit(&self, repo: &Repository, oid: Oid, name: &str) -> Result<String> {
        let target = repo.find_object(oid, Some(ObjectType::Commit))?;
        match repo.tag_lightweight(name, &target, false) {
            Ok(_) => Ok(name.to_string()),
            Err(e) if e.code() == ErrorCode::Exists => {
                let short = oid.to_string();
                let suffixed = format!("{name}-{}", &short[..7]);
                repo.tag_lightweight(&suffixed, &target, false)?;
                Ok(suffixed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Untrack top-level legacy folder snapshots and ignore them from now on.
    ///
    /// Returns the number of entries removed from history.
    pub fn migrate_legacy_folders(&self) -> Result<usize> {
        let repo = self.open_repo()?;
        let head_tree = match repo.head().and_then(|h| h.peel_to_tree()) {
            Ok(tree) => tree,
            Err(_) => return Ok(0),
        };

        let legacy: Vec<(String, bool)> = head_tree
            .iter()
            .filter_map(|e| {
                let name = e.name()?.to_string();
                is_legacy_folder(&name).then(|| (name, e.kind() == Some(ObjectType::Tree)))
            })
            .collect();

        if legacy.is_empty() {
            tracing::info!(root = %self.root.display(), "No legacy folders tracked in history");
            return Ok(0);
        }

        let mut index = repo.index()?;
        for batch in legacy.chunks(MIGRATION_BATCH) {
            for (name, is_dir) in batch {
                if *is_dir {
                    index.remove_dir(Path::new(name), 0)?;
                } else {
                    index.remove_path(Path::new(name))?;
                }
            }
            index.write()?;
            tracing::debug!(count = batch.len(), "Untracked legacy folder batch");
        }

        let gitignore = self.root.join(".gitignore");
        let mut content = std::fs::read_to_string(&gitignore).unwrap_or_default();
        let existing: BTreeSet<String> = content.lines().map(|l| l.trim().to_string()).collect();
        let mut additions = Vec::new();
        for (name, _) in &legacy {
            let line = format!("/{name}/");
            if !existing.contains(&line) {
                additions.push(line);
            }
        }
        if !additions.is_empty() {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str("\n# Legacy folder-mode snapshots\n");
            for line in additions {
                content.push_str(&line);
                content.push('\n');
            }
            std::fs::write(&gitignore, content)?;
        }
        index.add_path(Path::new(".gitignore"))?;
        index.write()?;

        commit_index(&repo, &mut index, MIGRATION_MESSAGE, Utc::now())?;
        tracing::info!(count = legacy.len(), "Legacy folders migrated out of history");
        Ok(legacy.len())
    }

    pub fn stats(&self) -> Result<RepoStats> {
        let repo = self.open_repo()?;

        let total_commits = match repo.head() {
            Ok(_) => {
                let mut walk = repo.revwalk()?;
                walk.push_head()?;
                walk.count()
            }
            Err(_) => 0,
        };

        let tags = repo.tag_names(None)?;
        let mut stats = RepoStats {
            total_commits,
            ..RepoStats::default()
        };
        for name in tags.iter().flatten() {
            stats.total_tags += 1;
            match SnapshotKind::infer(&[name], "") {
                SnapshotKind::Scheduled => stats.scheduled += 1,
                SnapshotKind::Autosave => stats.autosave += 1,
                SnapshotKind::PreRestore => stats.pre_restore += 1,
                SnapshotKind::Unknown => {}
            }
        }

        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        stats.uncommitted_changes = repo
            .statuses(Some(&mut opts))?
            .iter()
            .filter(|s| !s.status().is_ignored())
            .count();

        Ok(stats)
    }

    /// Opportunistic compaction; failures are logged only.
    fn compact(&self) {
        match std::process::Command::new("git")
            .args(["gc", "--auto"])
            .current_dir(&self.root)
            .output()
        {
            Ok(out) if out.status.success() => {
                tracing::debug!(root = %self.root.display(), "Repository compaction finished");
            }
            Ok(out) => {
                tracing::warn!(
                    root = %self.root.display(),
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "Repository compaction failed"
                );
            }
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "Could not run repository compaction");
            }
        }
    }
}

impl SnapshotBackend for HistoryBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::History
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn begin_snapshot(&self, _stamp: &SnapshotStamp) -> Result<PathBuf> {
        self.init()?;
        Ok(self.root.clone())
    }

    fn finish_snapshot(&self, _staging: &Path, stamp: &SnapshotStamp) -> Result<CommitOutcome> {
        self.commit_all(stamp)
    }

    fn list(&self) -> Result<Vec<Snapshot>> {
        let repo = self.open_repo()?;
        if repo.head().is_err() {
            return Ok(Vec::new());
        }

        let tags = tag_map(&repo)?;
        let mut walk = repo.revwalk()?;
        walk.push_head()?;
        walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)?;

        // Walk order is newest first, including commits made in the same second.
        let mut snapshots = Vec::new();
        for oid in walk {
            let commit = repo.find_commit(oid?)?;
            let message = commit.message().unwrap_or_default().trim().to_string();
            let tags = tags.get(&commit.id()).cloned().unwrap_or_default();
            snapshots.push(Snapshot {
                id: commit.id().to_string(),
                created_at: commit_time(&commit),
                kind: SnapshotKind::infer(&tags, &message),
                label: message,
                tags,
            });
        }

        Ok(snapshots)
    }

    fn diff(&self, id: &str, file: Option<&str>) -> Result<String> {
        let repo = self.open_repo()?;
        let commit = resolve_commit(&repo, id)?;
        if commit.parent_count() == 0 {
            return Err(TimeMachineError::NoParentRevision {
                revision: id.to_string(),
            });
        }

        let parent_tree = commit.parent(0)?.tree()?;
        let tree = commit.tree()?;
        let mut opts = DiffOptions::new();
        if let Some(file) = file {
            opts.pathspec(normalize_relative(file)?);
        }
        let diff = repo.diff_tree_to_tree(Some(&parent_tree), Some(&tree), Some(&mut opts))?;

        let mut patch = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                patch.push(line.origin());
            }
            patch.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(patch)
    }

    fn read_file_at(&self, id: &str, file: &str) -> Result<Vec<u8>> {
        let rel = normalize_relative(file)?;
        let repo = self.open_repo()?;
        let commit = resolve_commit(&repo, id)?;
        let missing = || TimeMachineError::FileNotFoundAtRevision {
            revision: id.to_string(),
            path: rel.clone(),
        };

        let entry = commit.tree()?.get_path(Path::new(&rel)).map_err(|_| missing())?;
        let blob = entry
            .to_object(&repo)?
            .into_blob()
            .map_err(|_| missing())?;
        Ok(blob.content().to_vec())
    }

    fn list_files(&self, id: &str) -> Result<Vec<String>> {
        let repo = self.open_repo()?;
        let commit = resolve_commit(&repo, id)?;
        let tree = commit.tree()?;
        tree_files(&tree)
    }

    fn file_tree(&self, id: &str) -> Result<Vec<TreeNode>> {
        let repo = self.open_repo()?;
        let commit = resolve_commit(&repo, id)?;
        let present: BTreeSet<String> = tree_files(&commit.tree()?)?.into_iter().collect();

        let mut historical = BTreeSet::new();
        let mut walk = repo.revwalk()?;
        walk.push_head()?;
        for oid in walk {
            let tree = repo.find_commit(oid?)?.tree()?;
            historical.extend(tree_files(&tree)?);
        }

        Ok(build_tree(&present, &historical))
    }

    /// Only tagged revisions are snapshots subject to retention.
    fn retention_candidates(&self) -> Result<Vec<Snapshot>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| !s.tags.is_empty())
            .collect())
    }

    fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        let repo = self.open_repo()?;
        for tag in &snapshot.tags {
            repo.tag_delete(tag)?;
        }
        Ok(())
    }

    fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let candidates = self.retention_candidates()?;
        let deleted = RetentionPolicy::new(keep).prune(&candidates, |s| self.delete(s));
        if !deleted.is_empty() {
            self.compact();
        }
        Ok(deleted)
    }
}

fn commit_index(
    repo: &Repository,
    index: &mut git2::Index,
    message: &str,
    at: DateTime<Utc>,
) -> Result<Oid> {
    let tree = repo.find_tree(index.write_tree()?)?;
    let sig = Signature::new(
        IDENTITY_NAME,
        IDENTITY_EMAIL,
        &git2::Time::new(at.timestamp(), 0),
    )?;
    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit()?],
        Err(_) => vec![],
    };
    let parent_refs: Vec<&Commit> = parents.iter().collect();
    Ok(repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?)
}

fn resolve_commit<'r>(repo: &'r Repository, id: &str) -> Result<Commit<'r>> {
    repo.revparse_single(id.trim())
        .and_then(|obj| obj.peel_to_commit())
        .map_err(|_| TimeMachineError::RevisionNotFound(id.to_string()))
}

fn commit_time(commit: &Commit) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn tag_map(repo: &Repository) -> Result<HashMap<Oid, Vec<String>>> {
    let mut map: HashMap<Oid, Vec<String>> = HashMap::new();
    for name in repo.tag_names(None)?.iter().flatten() {
        let target = repo
            .revparse_single(&format!("refs/tags/{name}"))
            .and_then(|obj| obj.peel_to_commit());
        if let Ok(commit) = target {
            map.entry(commit.id()).or_default().push(name.to_string());
        }
    }
    for tags in map.values_mut() {
        tags.sort();
    }
    Ok(map)
}

fn tree_files(tree: &Tree) -> Result<Vec<String>> {
    let mut files = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                let path = format!("{dir}{name}");
                if path != ".gitignore" {
                    files.push(path);
                }
            }
        }
        TreeWalkResult::Ok
    })?;
    files.sort();
    Ok(files)
}

fn is_legacy_folder(name: &str) -> bool {
    (name.len() == 4 && name.bytes().all(|c| c.is_ascii_digit()))
        || is_dashed_name(name)
        || is_numeric_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Trigger;
    use chrono::{Duration, TimeZone};
    use std::fs;
    use tempfile::TempDir;

    fn stamp(trigger: Trigger, offset_secs: i64) -> SnapshotStamp {
        SnapshotStamp {
            trigger,
            at: Utc.with_ymd_and_hms(2025, 6, 2, 15, 30, 0).unwrap() + Duration::seconds(offset_secs),
            timezone: None,
        }
    }

    fn setup() -> (TempDir, HistoryBackend) {
        let temp_dir = TempDir::new().unwrap();
        let backend = HistoryBackend::new(temp_dir.path().join("repo"));
        assert!(backend.init().unwrap());
        (temp_dir, backend)
    }

    #[test]
    fn test_init_is_idempotent() {
        let (_tmp, backend) = setup();
        assert!(!backend.init().unwrap());
        let list = backend.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, SnapshotKind::Unknown);
        assert!(backend.root().join(".gitignore").exists());
    }

    #[test]
    fn test_uninitialized_root() {
        let temp_dir = TempDir::new().unwrap();
        let backend = HistoryBackend::new(temp_dir.path());
        let err = backend.list().unwrap_err();
        assert!(matches!(err, TimeMachineError::BackendUninitialized { .. }));
    }

    #[test]
    fn test_commit_then_noop() {
        let (_tmp, backend) = setup();
        fs::write(backend.root().join("automations.yaml"), "- id: a\n").unwrap();

        let outcome = backend.commit_all(&stamp(Trigger::Scheduled, 0)).unwrap();
        let snapshot = outcome.snapshot().unwrap().clone();
        assert_eq!(snapshot.kind, SnapshotKind::Scheduled);
        assert_eq!(snapshot.tags, vec!["backup-scheduled-20250602T153000".to_string()]);

        let again = backend.commit_all(&stamp(Trigger::Scheduled, 1)).unwrap();
        assert_eq!(again, CommitOutcome::NoChanges);
        assert_eq!(backend.list().unwrap().len(), 2);
    }

    #[test]
    fn test_tag_collision_gets_suffix() {
        let (_tmp, backend) = setup();
        fs::write(backend.root().join("a.yaml"), "a: 1\n").unwrap();
        backend.commit_all(&stamp(Trigger::Scheduled, 0)).unwrap();
        fs::write(backend.root().join("a.yaml"), "a: 2\n").unwrap();
        let second = backend.commit_all(&stamp(Trigger::Scheduled, 0)).unwrap();
        let tag = &second.snapshot().unwrap().tags[0];
        assert!(tag.starts_with("backup-scheduled-20250602T153000-"));
    }

    #[test]
    fn test_diff_and_read() {
        let (_tmp, backend) = setup();
        let file = backend.root().join("scripts.yaml");
        fs::write(&file, "hello:\n  alias: Hello\n").unwrap();
        let first = backend.commit_all(&stamp(Trigger::Scheduled, 0)).unwrap();
        fs::write(&file, "hello:\n  alias: Hi\n").unwrap();
        let second = backend
            .commit_all(&stamp(Trigger::Autosave("scripts.yaml".into()), 10))
            .unwrap();

        let id = &second.snapshot().unwrap().id;
        let patch = backend.diff(id, Some("scripts.yaml")).unwrap();
        assert!(patch.contains("-  alias: Hello"));
        assert!(patch.contains("+  alias: Hi"));

        let old = backend.read_file_at(&first.snapshot().unwrap().id, "scripts.yaml").unwrap();
        assert_eq!(old, b"hello:\n  alias: Hello\n");

        let err = backend.read_file_at(id, "missing.yaml").unwrap_err();
        assert!(matches!(err, TimeMachineError::FileNotFoundAtRevision { .. }));
    }

    #[test]
    fn test_diff_of_unchanged_file_is_empty() {
        let (_tmp, backend) = setup();
        fs::write(backend.root().join("a.yaml"), "a: 1\n").unwrap();
        fs::write(backend.root().join("b.yaml"), "b: 1\n").unwrap();
        backend.commit_all(&stamp(Trigger::Scheduled, 0)).unwrap();
        fs::write(backend.root().join("a.yaml"), "a: 2\n").unwrap();
        let second = backend.commit_all(&stamp(Trigger::Scheduled, 60)).unwrap();

        let id = &second.snapshot().unwrap().id;
        assert_eq!(backend.diff(id, Some("b.yaml")).unwrap(), "");
        assert!(backend.diff(id, Some("a.yaml")).unwrap().contains("+a: 2"));
    }

    #[test]
    fn test_diff_of_root_revision() {
        let (_tmp, backend) = setup();
        let root = backend.list().unwrap().pop().unwrap();
        let err = backend.diff(&root.id, None).unwrap_err();
        assert!(matches!(err, TimeMachineError::NoParentRevision { .. }));
    }

    #[test]
    fn test_file_tree_marks_deleted() {
        let (_tmp, backend) = setup();
        fs::write(backend.root().join("old.yaml"), "x: 1\n").unwrap();
        backend.commit_all(&stamp(Trigger::Scheduled, 0)).unwrap();
        fs::remove_file(backend.root().join("old.yaml")).unwrap();
        fs::write(backend.root().join("new.yaml"), "x: 2\n").unwrap();
        let latest = backend.commit_all(&stamp(Trigger::Scheduled, 5)).unwrap();

        let tree = backend.file_tree(&latest.snapshot().unwrap().id).unwrap();
        let old = tree.iter().find(|n| n.name == "old.yaml").unwrap();
        assert!(old.deleted);
        let new = tree.iter().find(|n| n.name == "new.yaml").unwrap();
        assert!(!new.deleted);
    }

    #[test]
    fn test_prune_removes_oldest_tags() {
        let (_tmp, backend) = setup();
        for i in 0..4 {
            fs::write(backend.root().join("a.yaml"), format!("v: {i}\n")).unwrap();
            backend.commit_all(&stamp(Trigger::Scheduled, i * 60)).unwrap();
        }

        let deleted = backend.prune(2).unwrap();
        assert_eq!(deleted.len(), 2);
        let remaining = backend.retention_candidates().unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(
            remaining[0].tags,
            vec!["backup-scheduled-20250602T153300".to_string()]
        );
    }

    #[test]
    fn test_migrate_legacy_folders() {
        let (_tmp, backend) = setup();
        let root = backend.root();
        fs::create_dir_all(root.join("2024/05/2024-05-01-120000")).unwrap();
        fs::write(root.join("2024/05/2024-05-01-120000/a.yaml"), "a: 1\n").unwrap();
        fs::create_dir_all(root.join("202405011200")).unwrap();
        fs::write(root.join("202405011200/b.yaml"), "b: 1\n").unwrap();
        fs::write(root.join("automations.yaml"), "[]\n").unwrap();
        backend.commit_all(&stamp(Trigger::Scheduled, 0)).unwrap();

        assert_eq!(backend.migrate_legacy_folders().unwrap(), 2);
        let head = backend.list().unwrap()[0].id.clone();
        assert_eq!(backend.list_files(&head).unwrap(), vec!["automations.yaml"]);
        assert!(root.join("2024/05/2024-05-01-120000/a.yaml").exists());

        assert_eq!(backend.migrate_legacy_folders().unwrap(), 0);
    }

    #[test]
    fn test_stats() {
        let (_tmp, backend) = setup();
        fs::write(backend.root().join("a.yaml"), "a: 1\n").unwrap();
        backend.commit_all(&stamp(Trigger::Scheduled, 0)).unwrap();
        fs::write(backend.root().join("a.yaml"), "a: 2\n").unwrap();
        backend
            .commit_all(&stamp(Trigger::Autosave("a.yaml".into()), 30))
            .unwrap();
        fs::write(backend.root().join("b.yaml"), "b: 1\n").unwrap();

        let stats = backend.stats().unwrap();
        assert_eq!(stats.total_commits, 3);
        assert_eq!(stats.total_tags, 2);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.autosave, 1);
        assert_eq!(stats.uncommitted_changes, 1);
    }
}
