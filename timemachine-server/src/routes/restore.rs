use super::blocking;
use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use timemachine_core::backend;
use timemachine_core::config::Settings;
use timemachine_core::restore::{self, ItemKind, ReloadHint, RestoreContext};
use timemachine_core::writer::SnapshotWriter;
use timemachine_core::TimeMachineError;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/restore-file", post(restore_file))
        .route("/api/restore-item", post(restore_item))
        .route("/api/backup-items", post(backup_items))
        .route("/api/live-items", post(live_items))
}

fn context(settings: &Settings) -> RestoreContext {
    RestoreContext {
        live_root: settings.backup.live_config_path.clone(),
        timezone: settings.backup.timezone.clone(),
        credentials_configured: settings.reload_credentials_configured(),
        writer: SnapshotWriter::from_settings(settings),
    }
}

#[derive(Deserialize)]
pub struct RestoreFileRequest {
    pub revision: String,
    pub file: String,
}

async fn restore_file(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RestoreFileRequest>,
) -> Result<Json<ReloadHint>, AppError> {
    let settings = state.settings()?;
    let hint = blocking(move || {
        let backend = backend::open(settings.backup.mode, settings.backup.backup_folder_path.clone());
        context(&settings).restore_file(backend.as_ref(), &req.revision, &req.file)
    })
    .await?;
    Ok(Json(hint))
}

#[derive(Deserialize)]
pub struct RestoreItemRequest {
    pub kind: ItemKind,
    pub item: serde_yaml::Value,
}

async fn restore_item(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RestoreItemRequest>,
) -> Result<Json<ReloadHint>, AppError> {
    let settings = state.settings()?;
    let hint = blocking(move || {
        let backend = backend::open(settings.backup.mode, settings.backup.backup_folder_path.clone());
        context(&settings).restore_item(backend.as_ref(), req.kind, req.item)
    })
    .await?;
    Ok(Json(hint))
}

#[derive(Deserialize)]
pub struct BackupItemsRequest {
    pub revision: String,
    pub kind: ItemKind,
}

/// Automations or scripts as stored in a snapshot.
async fn backup_items(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BackupItemsRequest>,
) -> Result<Json<Value>, AppError> {
    let settings = state.settings()?;
    let items = blocking(move || {
        let backend = backend::open(settings.backup.mode, settings.backup.backup_folder_path.clone());
        restore::read_items(backend.as_ref(), &req.revision, req.kind)
    })
    .await?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct LiveItemsRequest {
    pub kind: ItemKind,
    /// Id or alias of a single item
    pub id: Option<String>,
}

/// Automations or scripts as they are in the live tree now.
async fn live_items(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LiveItemsRequest>,
) -> Result<Json<Value>, AppError> {
    let settings = state.settings()?;
    let live_root = settings.backup.live_config_path.clone();
    let items = blocking({
        let live_root = live_root.clone();
        move || restore::read_live_items(&live_root, req.kind)
    })
    .await?;

    match req.id {
        None => Ok(Json(json!({ "items": items }))),
        Some(id) => match restore::find_item(&items, &id) {
            Some(item) => Ok(Json(json!({ "item": item }))),
            None => Err(TimeMachineError::not_found(
                format!("item '{id}'"),
                live_root.join(req.kind.file_name()),
            )
            .into()),
        },
    }
}
