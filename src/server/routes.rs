//! Router configuration for the job API.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::handlers;
use super::{rate_limit_middleware, AppState};

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Jobs
        .route("/jobs", get(handlers::list_jobs))
        .route("/jobs/stats", get(handlers::job_stats))
        .route("/jobs/:job_id", get(handlers::get_job))
        .route("/jobs/:job_id/retry", post(handlers::retry_job))
        .route("/jobs/:job_id/skip", post(handlers::skip_job))
        .route("/jobs/:job_id/cancel", post(handlers::cancel_job))
        // Recovery
        .route("/jobs/recovery/stats", get(handlers::recovery_stats))
        .route("/jobs/recovery/run", post(handlers::run_recovery))
        .route("/jobs/recovery/:job_id", post(handlers::recover_one))
        // Rate limit introspection
        .route("/limits/status", get(handlers::rate_limit_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
