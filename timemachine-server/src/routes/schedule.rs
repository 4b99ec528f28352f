use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use timemachine_core::schedule::ScheduleJob;
use timemachine_core::TimeMachineError;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/schedule",
        get(get_schedule).post(set_schedule).delete(remove_schedule),
    )
}

async fn get_schedule(State(state): State<Arc<AppState>>) -> Json<Value> {
    let jobs: BTreeMap<String, ScheduleJob> = state
        .schedules
        .jobs()
        .await
        .into_iter()
        .map(|job| (job.id.clone(), job))
        .collect();
    Json(json!({ "jobs": jobs }))
}

#[derive(Deserialize)]
pub struct SetScheduleRequest {
    pub id: String,
    #[serde(flatten)]
    pub job: ScheduleJob,
}

async fn set_schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetScheduleRequest>,
) -> Result<Json<Value>, AppError> {
    let mut job = req.job;
    job.id = req.id;
    let id = job.id.clone();

    state.schedules.upsert(job).await?;
    Ok(Json(json!({
        "success": true,
        "id": id,
        "message": "Schedule updated successfully",
    })))
}

#[derive(Deserialize)]
pub struct RemoveScheduleQuery {
    pub id: String,
}

async fn remove_schedule(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RemoveScheduleQuery>,
) -> Result<Json<Value>, AppError> {
    if !state.schedules.remove(&query.id).await? {
        let settings = state.settings()?;
        return Err(TimeMachineError::not_found(
            format!("schedule '{}'", query.id),
            settings.schedule_file(),
        )
        .into());
    }
    Ok(Json(json!({ "success": true, "id": query.id })))
}
