//! HTTP surface for job inspection, control, and recovery.

mod error;
mod handlers;
mod routes;

pub use error::ApiError;
pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::cache::MatterQueryCache;
use crate::config::Settings;
use crate::eta::EtaEstimator;
use crate::external::BlobStore;
use crate::pipeline::PipelineOrchestrator;
use crate::rate_limit::{extract_key, Decision, RateLimiter, Tier};
use crate::recovery::StaleJobRecovery;
use crate::repository::{ChunkRepository, DocumentRepository};
use crate::tracking::JobTracker;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub tracker: JobTracker,
    pub docs: Arc<DocumentRepository>,
    pub chunks: Arc<ChunkRepository>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub recovery: Arc<StaleJobRecovery>,
    pub limiter: Arc<RateLimiter>,
    pub eta: Arc<EtaEstimator>,
    pub cache: Arc<MatterQueryCache>,
    pub blob: Arc<dyn BlobStore>,
}

/// Ingress rate limiting. Tier is derived from the request shape; the
/// principal is the upstream-authenticated user id header, else the client
/// address.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.settings.rate_limit_enabled {
        return next.run(request).await;
    }

    let tier = Tier::for_request(request.method(), request.uri().path());
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());
    let user_id = request
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let key = extract_key(
        user_id.as_deref(),
        request.headers(),
        remote.as_deref(),
        &state.settings.forwarded_for_header,
    );

    match state.limiter.check(&key, tier).await {
        Decision::Allow { .. } => next.run(request).await,
        Decision::Deny {
            limit,
            reset_at,
            retry_after_secs,
        } => {
            let body = json!({
                "error": {
                    "code": "RATE_LIMIT_EXCEEDED",
                    "message": format!(
                        "Rate limit exceeded: {limit} per {}",
                        tier.window()
                    ),
                    "details": {
                        "limit": limit,
                        "remaining": 0,
                        "reset_at": reset_at,
                        "retry_after": retry_after_secs,
                    }
                }
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            let headers = response.headers_mut();
            headers.insert("Retry-After", retry_after_secs.into());
            headers.insert("X-RateLimit-Limit", limit.into());
            headers.insert("X-RateLimit-Remaining", 0.into());
            headers.insert("X-RateLimit-Reset", reset_at.into());
            response
        }
    }
}

/// Start the web server.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
