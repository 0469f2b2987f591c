//! Wire types and error mapping for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::Error;

/// The error envelope every failed request returns.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Always `false`.
    pub success: bool,
    /// Human-readable message.
    pub error: String,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Actionable context, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,
}

/// Suggestions attached to an error response.
#[derive(Debug, Serialize)]
pub struct ErrorContext {
    /// Up to three actionable suggestions.
    pub suggestions: Vec<String>,
    /// Documentation link, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help_url: Option<String>,
}

/// Library error adapted for axum.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "INVALID_INPUT" | "UNKNOWN_SERVICE_TYPE" => StatusCode::BAD_REQUEST,
        "AUTH_REQUIRED" | "AUTH_INVALID" => StatusCode::UNAUTHORIZED,
        "INVALID_LOCK_ID" | "NOT_FOUND" => StatusCode::NOT_FOUND,
        "RANGE_EXHAUSTED" | "CONFLICT" => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn context_for(err: &Error) -> Option<ErrorContext> {
    match err {
        Error::UnknownServiceType { name } => Some(ErrorContext {
            suggestions: vec![
                format!("add a '{name}' entry to config.json"),
                "enable auto_allocation to have a range synthesized".to_string(),
                "run `berth config show` to see known service types".to_string(),
            ],
            help_url: None,
        }),
        Error::RangeExhausted { service_type, .. } => Some(ErrorContext {
            suggestions: vec![
                format!("run `berth cleanup` to drop stale '{service_type}' allocations"),
                "release unused lock ids".to_string(),
                format!("widen the '{service_type}' range in config.json"),
            ],
            help_url: None,
        }),
        Error::InvalidLockId { .. } => Some(ErrorContext {
            suggestions: vec![
                "run `berth list` to see live lock ids".to_string(),
                "lock ids are UUIDs issued by allocate".to_string(),
            ],
            help_url: None,
        }),
        _ => None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if err.is_expected() {
            tracing::debug!(error = %err, "request failed");
        } else {
            tracing::error!(error = %err, "request failed");
        }
        let code = err.code();
        let body = ErrorBody {
            success: false,
            error: err.to_string(),
            code,
            context: context_for(&err),
        };
        (status_for(code), Json(body)).into_response()
    }
}
