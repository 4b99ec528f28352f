use super::blocking;
use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use timemachine_core::backend::{self, HistoryBackend, SnapshotBackend};
use timemachine_core::config::{BackendMode, Settings};
use timemachine_core::scanner;
use timemachine_core::snapshot::{RepoStats, Trigger};
use timemachine_core::writer::{SnapshotWriter, WriteReport};
use timemachine_core::TimeMachineError;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/scan-backups", post(scan_backups))
        .route("/api/backup-now", post(backup_now))
        .route("/api/diff", post(diff))
        .route("/api/files", post(list_files))
        .route("/api/file-tree", post(file_tree))
        .route("/api/file", post(read_file))
        .route("/api/stats", get(stats))
}

fn open_backend(settings: &Settings) -> Box<dyn SnapshotBackend> {
    backend::open(settings.backup.mode, settings.backup.backup_folder_path.clone())
}

fn reject_traversal(path: &std::path::Path) -> Result<(), AppError> {
    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(AppError::BadRequest("Invalid path".into()));
    }
    Ok(())
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub backup_root_path: Option<PathBuf>,
}

async fn scan_backups(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ScanRequest>>,
) -> Result<Json<Value>, AppError> {
    let settings = state.settings()?;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let root = req
        .backup_root_path
        .unwrap_or_else(|| settings.backup.backup_folder_path.clone());
    reject_traversal(&root)?;

    match settings.backup.mode {
        BackendMode::History => {
            let backups = blocking(move || HistoryBackend::new(root).list()).await?;
            Ok(Json(json!({ "mode": "history", "backups": backups })))
        }
        BackendMode::Folder => {
            let mut backups = blocking(move || scanner::scan(&root)).await?;
            backups.sort_by(|a, b| b.folder_name.cmp(&a.folder_name));
            Ok(Json(json!({ "mode": "folder", "backups": backups })))
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupNowRequest {
    pub live_config_path: Option<PathBuf>,
    pub backup_folder_path: Option<PathBuf>,
    pub max_backups_enabled: Option<bool>,
    pub max_backups_count: Option<usize>,
    pub timezone: Option<String>,
}

async fn backup_now(
    State(state): State<Arc<AppState>>,
    body: Option<Json<BackupNowRequest>>,
) -> Result<Json<WriteReport>, AppError> {
    let settings = state.settings()?;
    let req = body.map(|Json(b)| b).unwrap_or_default();

    let source = req
        .live_config_path
        .unwrap_or_else(|| settings.backup.live_config_path.clone());
    let destination = req
        .backup_folder_path
        .unwrap_or_else(|| settings.backup.backup_folder_path.clone());
    reject_traversal(&destination)?;

    let retention_enabled = req
        .max_backups_enabled
        .unwrap_or(settings.backup.max_backups_enabled);
    let keep = req.max_backups_count.unwrap_or(settings.backup.max_backups_count);
    let writer = SnapshotWriter::from_settings(&settings).with_retention(retention_enabled.then_some(keep));
    let timezone = req.timezone.or_else(|| settings.backup.timezone.clone());
    let mode = settings.backup.mode;

    let report = blocking(move || {
        let backend = backend::open(mode, destination);
        writer.write(backend.as_ref(), &source, Trigger::Manual, timezone)
    })
    .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
pub struct RevisionRequest {
    pub revision: String,
    pub file: Option<String>,
}

async fn diff(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevisionRequest>,
) -> Result<Json<Value>, AppError> {
    let settings = state.settings()?;
    let diff = blocking(move || open_backend(&settings).diff(&req.revision, req.file.as_deref())).await?;
    Ok(Json(json!({ "diff": diff })))
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevisionRequest>,
) -> Result<Json<Value>, AppError> {
    let settings = state.settings()?;
    let files = blocking(move || open_backend(&settings).list_files(&req.revision)).await?;
    Ok(Json(json!({ "files": files })))
}

#[derive(Deserialize, Default)]
pub struct TreeRequest {
    pub revision: Option<String>,
}

async fn file_tree(
    State(state): State<Arc<AppState>>,
    body: Option<Json<TreeRequest>>,
) -> Result<Json<Value>, AppError> {
    let settings = state.settings()?;
    let req = body.map(|Json(b)| b).unwrap_or_default();

    let (revision, tree) = blocking(move || {
        let backend = open_backend(&settings);
        let revision = match req.revision {
            Some(revision) => revision,
            None => backend
                .list()?
                .into_iter()
                .next()
                .map(|s| s.id)
                .ok_or_else(|| TimeMachineError::not_found("snapshot", backend.root()))?,
        };
        let tree = backend.file_tree(&revision)?;
        Ok((revision, tree))
    })
    .await?;
    Ok(Json(json!({ "revision": revision, "tree": tree })))
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevisionRequest>,
) -> Result<Json<Value>, AppError> {
    let settings = state.settings()?;
    let file = req
        .file
        .ok_or_else(|| AppError::BadRequest("file is required".into()))?;
    let revision = req.revision;

    let content = blocking(move || open_backend(&settings).read_file_at(&revision, &file)).await?;
    Ok(Json(json!({ "content": String::from_utf8_lossy(&content) })))
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<RepoStats>, AppError> {
    let settings = state.settings()?;
    let root = settings.backup.backup_folder_path.clone();
    let stats = blocking(move || HistoryBackend::new(root).stats()).await?;
    Ok(Json(stats))
}
