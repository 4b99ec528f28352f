//! Snapshot identity, classification and ordering.

use crate::utils::errors::{Result, TimeMachineError};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotKind {
    Scheduled,
    Autosave,
    PreRestore,
    Unknown,
}

impl SnapshotKind {
    pub fn tag_prefix(self) -> Option<&'static str> {
        match self {
            SnapshotKind::Scheduled => Some("backup-scheduled-"),
            SnapshotKind::Autosave => Some("autosave-"),
            SnapshotKind::PreRestore => Some("pre-restore-"),
            SnapshotKind::Unknown => None,
        }
    }

    fn message_prefix(self) -> Option<&'static str> {
        match self {
            SnapshotKind::Scheduled => Some("Scheduled Backup"),
            SnapshotKind::Autosave => Some("Auto-save"),
            SnapshotKind::PreRestore => Some("Pre-restore Backup"),
            SnapshotKind::Unknown => None,
        }
    }

    /// Classify from tags first, then the message, else `Unknown`.
    pub fn infer<S: AsRef<str>>(tags: &[S], message: &str) -> Self {
        const KNOWN: [SnapshotKind; 3] = [
            SnapshotKind::Scheduled,
            SnapshotKind::Autosave,
            SnapshotKind::PreRestore,
        ];

        for kind in KNOWN {
            let prefix = kind.tag_prefix().unwrap_or_default();
            if tags.iter().any(|t| t.as_ref().starts_with(prefix)) {
                return kind;
            }
        }
        for kind in KNOWN {
            let prefix = kind.message_prefix().unwrap_or_default();
            if message.starts_with(prefix) {
                return kind;
            }
        }
        SnapshotKind::Unknown
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SnapshotKind::Scheduled => "scheduled",
            SnapshotKind::Autosave => "autosave",
            SnapshotKind::PreRestore => "pre-restore",
            SnapshotKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A restorable point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Revision hash (history) or root-relative directory (folder)
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub kind: SnapshotKind,
    /// Commit message or folder name
    pub label: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Newest first: `created_at` descending, ties broken by `id` descending.
pub fn newest_first(a: &Snapshot, b: &Snapshot) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Why a snapshot is being taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
    PreRestore,
    /// Root-relative path of the file that changed
    Autosave(String),
}

impl Trigger {
    pub fn kind(&self) -> SnapshotKind {
        match self {
            Trigger::Scheduled | Trigger::Manual => SnapshotKind::Scheduled,
            Trigger::PreRestore => SnapshotKind::PreRestore,
            Trigger::Autosave(_) => SnapshotKind::Autosave,
        }
    }
}

/// Handed to a backend when a snapshot starts.
#[derive(Debug, Clone)]
pub struct SnapshotStamp {
    pub trigger: Trigger,
    pub at: DateTime<Utc>,
    /// IANA timezone for wall-clock naming
    pub timezone: Option<String>,
}

impl SnapshotStamp {
    pub fn now(trigger: Trigger, timezone: Option<String>) -> Self {
        Self {
            trigger,
            at: Utc::now(),
            timezone,
        }
    }

    pub fn kind(&self) -> SnapshotKind {
        self.trigger.kind()
    }

    /// Wall-clock time in the stamp's timezone, or local time without one.
    pub fn wall_clock(&self) -> Result<NaiveDateTime> {
        match self.timezone.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(name) => {
                let tz = parse_timezone(name)?;
                Ok(self.at.with_timezone(&tz).naive_local())
            }
            None => Ok(self.at.with_timezone(&Local).naive_local()),
        }
    }

    /// Compact UTC form used in tag names, e.g. `20250602T153045`.
    pub fn compact(&self) -> String {
        self.at.format("%Y%m%dT%H%M%S").to_string()
    }

    pub fn message(&self) -> String {
        let ts = self.at.format("%Y-%m-%d %H:%M:%S");
        match &self.trigger {
            Trigger::Scheduled | Trigger::Manual => format!("Scheduled Backup: {ts}"),
            Trigger::PreRestore => format!("Pre-restore Backup: {ts}"),
            Trigger::Autosave(file) => {
                let name = file.rsplit('/').next().unwrap_or(file);
                format!("Auto-save: {name} modified at {ts}")
            }
        }
    }

    pub fn tag_name(&self) -> String {
        let prefix = self.kind().tag_prefix().unwrap_or("backup-");
        format!("{prefix}{}", self.compact())
    }
}

/// Result of finalizing a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "snapshot", rename_all = "snake_case")]
pub enum CommitOutcome {
    Created(Snapshot),
    /// Nothing differed from the previous revision
    NoChanges,
}

impl CommitOutcome {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            CommitOutcome::Created(s) => Some(s),
            CommitOutcome::NoChanges => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Dir,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    /// Present earlier in history but absent at this revision
    pub deleted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStats {
    pub total_commits: usize,
    pub total_tags: usize,
    pub scheduled: usize,
    pub autosave: usize,
    pub pre_restore: usize,
    pub uncommitted_changes: usize,
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| TimeMachineError::InvalidInput(format!("unknown timezone: {name}")))
}
