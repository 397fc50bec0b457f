//! HTTP error mapping for the context API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use ctxmesh_types::StoreError;

/// Error surface of every context API handler.
///
/// Replication-pipeline failures are absorbed before they reach this type;
/// only the local operation (or, for forwarded writes, the authority's
/// answer) decides the response.
#[derive(Debug)]
pub enum ApiError {
    /// Context absent.
    NotFound(String),
    /// Malformed id or request body.
    Invalid(String),
    /// A forwarded write could not reach the authority.
    UpstreamUnavailable(String),
    /// Local disk or serialization failure.
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("context not found: {id}")),
            StoreError::Invalid(msg) => ApiError::Invalid(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Invalid(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::UpstreamUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
