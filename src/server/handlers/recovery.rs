//! Recovery inspection and manual-trigger endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use super::super::{ApiError, AppState};

/// Current stale-job picture plus the sweeper's configuration.
pub async fn recovery_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.recovery.stats()?;
    Ok(Json(json!({ "data": stats })))
}

/// Run a full recovery sweep now.
pub async fn run_recovery(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state.recovery.recover_all().await;
    Ok(Json(json!({ "data": summary })))
}

/// Attempt recovery of a single job.
pub async fn recover_one(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Surface the job's absence as a 404 rather than a skipped outcome.
    state.tracker.repo().get_required(&job_id)?;
    let outcome = state.recovery.recover_job(&job_id).await;
    Ok(Json(json!({ "data": outcome })))
}
