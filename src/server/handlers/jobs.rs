//! Job listing, inspection, and control endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::super::{ApiError, AppState};
use crate::matter::{validate_rows, MatterId};
use crate::models::{JobListItem, JobStageHistory, JobStatus, ProcessingJob, QueueStats};
use crate::repository::JobFilter;

/// Query parameters for job listings.
#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub matter_id: Option<String>,
    pub document_id: Option<String>,
    /// Page number (1-indexed).
    pub page: Option<usize>,
    /// Items per page (default 50, max 100).
    pub per_page: Option<usize>,
}

/// Pagination metadata for list responses.
#[derive(Debug, Serialize)]
pub struct PaginationMeta {
    pub total: u64,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: u64,
}

#[derive(Debug, Serialize)]
pub struct JobsListResponse {
    pub data: Vec<JobListItem>,
    pub meta: PaginationMeta,
}

/// List jobs with filters and pagination.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobsQuery>,
) -> Result<Json<JobsListResponse>, ApiError> {
    let matter = params
        .matter_id
        .as_deref()
        .map(MatterId::parse)
        .transpose()?;

    let status = params
        .status
        .as_deref()
        .map(|raw| {
            JobStatus::from_str(raw)
                .ok_or_else(|| ApiError::invalid_parameter(format!("unknown status {raw:?}")))
        })
        .transpose()?;

    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(50).clamp(1, 100);

    let result = state.tracker.repo().list(&JobFilter {
        matter_id: matter.as_ref().map(|m| m.as_str().to_string()),
        status,
        document_id: params.document_id.clone(),
        page,
        per_page,
    })?;

    // The query already filtered by matter; every returned row is re-checked.
    let jobs = match &matter {
        Some(matter) => validate_rows(result.jobs, matter)?,
        None => result.jobs,
    };

    let total_pages = result.total.div_ceil(per_page as u64);
    Ok(Json(JobsListResponse {
        data: jobs.iter().map(JobListItem::from).collect(),
        meta: PaginationMeta {
            total: result.total,
            page,
            per_page,
            total_pages,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub matter_id: String,
}

/// Queue statistics for one matter.
pub async fn job_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let matter = MatterId::parse(&params.matter_id)?;
    let stats: QueueStats = state.tracker.repo().stats_by_matter(matter.as_str())?;
    Ok(Json(json!({ "data": stats })))
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: ProcessingJob,
    pub stage_history: Vec<JobStageHistory>,
}

/// Fetch one job with its stage history.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state.tracker.repo().get_required(&job_id)?;
    let stage_history = state.tracker.repo().stage_history(&job_id)?;
    Ok(Json(json!({
        "data": JobDetail { job, stage_history }
    })))
}

#[derive(Debug, Deserialize)]
pub struct RetryBody {
    /// Reset the retry budget along with the status.
    #[serde(default = "default_true")]
    pub reset_retry_count: bool,
    /// Also clear the current stage's saved partial progress.
    #[serde(default)]
    pub restart: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RetryBody {
    fn default() -> Self {
        Self {
            reset_retry_count: true,
            restart: false,
        }
    }
}

/// Re-queue a terminal job.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Option<Json<RetryBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let outcome = state
        .orchestrator
        .retry(&job_id, body.reset_retry_count, body.restart)
        .await?;
    Ok(Json(json!({
        "data": {
            "new_status": outcome.new_status,
            "message": outcome.message,
        }
    })))
}

#[derive(Debug, Deserialize, Default)]
pub struct SkipBody {
    #[serde(default)]
    pub reason: String,
}

/// Mark a job skipped so it stops surfacing as actionable.
pub async fn skip_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Option<Json<SkipBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let job = state.orchestrator.skip(&job_id, &body.reason).await?;
    Ok(Json(json!({ "data": { "new_status": job.status } })))
}

/// Cancel a job cooperatively.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state.orchestrator.cancel(&job_id).await?;
    Ok(Json(json!({ "data": { "new_status": job.status } })))
}
