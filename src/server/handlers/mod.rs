//! Handler implementations for the job API.

mod jobs;
mod recovery;

pub use jobs::{cancel_job, get_job, job_stats, list_jobs, retry_job, skip_job};
pub use recovery::{recover_one, recovery_stats, run_recovery};

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use std::net::SocketAddr;

use super::AppState;
use crate::rate_limit::extract_key;

/// Liveness probe.
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Current principal's rate limit configuration.
pub async fn rate_limit_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let remote = addr.ip().to_string();
    let key = extract_key(
        user_id.as_deref(),
        &headers,
        Some(&remote),
        &state.settings.forwarded_for_header,
    );
    Json(state.limiter.status(&key))
}
