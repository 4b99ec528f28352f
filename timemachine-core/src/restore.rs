//! Restoring files and individual automations or scripts into the live tree.
//!
//! Every restore takes a `pre-restore` snapshot of the live tree first, so
//! the state being overwritten can itself be restored later.

use crate::backend::SnapshotBackend;
use crate::snapshot::Trigger;
use crate::utils::errors::{Result, TimeMachineError};
use crate::utils::paths::{normalize_relative, resolve_within};
use crate::writer::SnapshotWriter;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Automation,
    Script,
}

impl ItemKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ItemKind::Automation => "automations.yaml",
            ItemKind::Script => "scripts.yaml",
        }
    }

    pub fn reload_domain(self) -> &'static str {
        match self {
            ItemKind::Automation => "automation.reload",
            ItemKind::Script => "script.reload",
        }
    }
}

/// What the upstream platform should reload after a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadHint {
    pub domains: Vec<String>,
    /// Whether the reload API could be called from here
    pub credentials_configured: bool,
}

impl ReloadHint {
    pub fn for_file(rel_path: &str, credentials_configured: bool) -> Self {
        let domains = match rel_path {
            "automations.yaml" => vec![ItemKind::Automation.reload_domain().to_string()],
            "scripts.yaml" => vec![ItemKind::Script.reload_domain().to_string()],
            _ => Vec::new(),
        };
        Self {
            domains,
            credentials_configured,
        }
    }
}

/// Restores into one live tree, snapshotting it beforehand.
#[derive(Debug, Clone)]
pub struct RestoreContext {
    pub live_root: PathBuf,
    pub timezone: Option<String>,
    pub credentials_configured: bool,
    pub writer: SnapshotWriter,
}

impl RestoreContext {
    /// Never prunes: the snapshots being browsed must survive a restore.
    fn pre_restore(&self, backend: &dyn SnapshotBackend) -> Result<()> {
        let report = self.writer.clone().with_retention(None).write(
            backend,
            &self.live_root,
            Trigger::PreRestore,
            self.timezone.clone(),
        )?;
        tracing::info!(
            root = %backend.root().display(),
            created = report.outcome.snapshot().is_some(),
            "Pre-restore snapshot taken"
        );
        Ok(())
    }

    /// Write the bytes `rel_path` had at `revision` back into the live tree.
    pub fn restore_file(
        &self,
        backend: &dyn SnapshotBackend,
        revision: &str,
        rel_path: &str,
    ) -> Result<ReloadHint> {
        let rel = normalize_relative(rel_path)?;
        let content = backend.read_file_at(revision, &rel)?;
        let target = resolve_within(&self.live_root, &rel)?;

        self.pre_restore(backend)?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;

        tracing::info!(revision, file = %rel, "File restored");
        Ok(ReloadHint::for_file(&rel, self.credentials_configured))
    }

    /// Replace a single automation or script in the live tree.
    pub fn restore_item(
        &self,
        backend: &dyn SnapshotBackend,
        kind: ItemKind,
        item: Value,
    ) -> Result<ReloadHint> {
        identifiers(&item)?;
        self.pre_restore(backend)?;
        restore_item(&self.live_root, kind, item)?;
        Ok(ReloadHint {
            domains: vec![kind.reload_domain().to_string()],
            credentials_configured: self.credentials_configured,
        })
    }
}

fn identifier(item: &Value, field: &str) -> Option<String> {
    match item.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `(id, alias)` of an item; at least one must be present.
fn identifiers(item: &Value) -> Result<(Option<String>, Option<String>)> {
    if !item.is_mapping() {
        return Err(TimeMachineError::InvalidInput("item must be a mapping".into()));
    }
    let id = identifier(item, "id");
    let alias = identifier(item, "alias");
    if id.is_none() && alias.is_none() {
        return Err(TimeMachineError::InvalidInput(
            "item has neither an id nor an alias".into(),
        ));
    }
    Ok((id, alias))
}

/// Parsed items plus whether the document used the keyed mapping shape.
fn parse_items(kind: ItemKind, content: &str) -> Result<(Vec<Value>, bool)> {
    let doc: Value = if content.trim().is_empty() {
        Value::Null
    } else {
        serde_yaml::from_str(content)?
    };

    match (kind, doc) {
        (_, Value::Null) => Ok((Vec::new(), false)),
        (_, Value::Sequence(items)) => Ok((items, false)),
        (ItemKind::Script, Value::Mapping(scripts)) => {
            let items = scripts
                .into_iter()
                .map(|(key, body)| {
                    let mut item = Mapping::new();
                    item.insert(Value::from("id"), key);
                    if let Value::Mapping(fields) = body {
                        for (k, v) in fields {
                            if k.as_str() != Some("id") {
                                item.insert(k, v);
                            }
                        }
                    }
                    Value::Mapping(item)
                })
                .collect();
            Ok((items, true))
        }
        (kind, _) => Err(TimeMachineError::InvalidInput(format!(
            "{} has an unexpected shape",
            kind.file_name()
        ))),
    }
}

fn render_items(items: Vec<Value>, keyed: bool) -> Result<String> {
    if !keyed {
        return Ok(serde_yaml::to_string(&Value::Sequence(items))?);
    }

    let mut scripts = Mapping::new();
    for item in items {
        let Some(key) = identifier(&item, "id").or_else(|| identifier(&item, "alias")) else {
            continue;
        };
        let mut body = match item {
            Value::Mapping(fields) => fields,
            _ => Mapping::new(),
        };
        body.remove("id");
        scripts.insert(Value::from(key), Value::Mapping(body));
    }
    Ok(serde_yaml::to_string(&Value::Mapping(scripts))?)
}

/// Union-replace `item` into the live automations or scripts file by id or alias.
pub fn restore_item(live_root: &Path, kind: ItemKind, item: Value) -> Result<()> {
    let (id, alias) = identifiers(&item)?;
    let path = live_root.join(kind.file_name());

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let (mut items, keyed) = parse_items(kind, &content)?;

    let before = items.len();
    items.retain(|existing| {
        let same_id = id.is_some() && identifier(existing, "id") == id;
        let same_alias = alias.is_some() && identifier(existing, "alias") == alias;
        !(same_id || same_alias)
    });
    let replaced = before - items.len();
    items.push(item);

    std::fs::write(&path, render_items(items, keyed)?)?;
    tracing::info!(
        file = kind.file_name(),
        id = id.as_deref().unwrap_or(""),
        alias = alias.as_deref().unwrap_or(""),
        replaced,
        "Item restored"
    );
    Ok(())
}

/// Automations or scripts as they were at `revision`, as a flat list.
pub fn read_items(backend: &dyn SnapshotBackend, revision: &str, kind: ItemKind) -> Result<Vec<Value>> {
    let bytes = match backend.read_file_at(revision, kind.file_name()) {
        Ok(bytes) => bytes,
        Err(TimeMachineError::FileNotFoundAtRevision { .. }) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let (items, _) = parse_items(kind, &String::from_utf8_lossy(&bytes))?;
    Ok(items)
}

/// Automations or scripts currently in the live tree, as a flat list.
pub fn read_live_items(live_root: &Path, kind: ItemKind) -> Result<Vec<Value>> {
    let content = match std::fs::read_to_string(live_root.join(kind.file_name())) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let (items, _) = parse_items(kind, &content)?;
    Ok(items)
}

/// First item whose id or alias equals `key`.
pub fn find_item<'a>(items: &'a [Value], key: &str) -> Option<&'a Value> {
    items.iter().find(|item| {
        identifier(item, "id").as_deref() == Some(key)
            || identifier(item, "alias").as_deref() == Some(key)
    })
}
