//! API error envelope: `{ "error": { "code", "message", "details" } }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::matter::MatterError;
use crate::repository::RepositoryError;

/// Error returned by any handler; serializes as the standard envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: json!({}),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_PARAMETER", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            message,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "details": self.details,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => Self::not_found(format!("{what} not found")),
            RepositoryError::Conflict(message) => Self::conflict(message),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<MatterError> for ApiError {
    fn from(err: MatterError) -> Self {
        match &err {
            MatterError::InvalidMatter(_) => Self::invalid_parameter(err.to_string()),
            MatterError::LeakDetected { .. } => {
                // Never swallowed: logged here and surfaced as a 500.
                error!(error = %err, "matter isolation violation");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "MATTER_ISOLATION_VIOLATION",
                    "matter isolation violation",
                )
            }
        }
    }
}
