pub mod chat;
pub mod health;
pub mod nodes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::gateway::DispatchError;

/// Errors returned by the HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No node available for model {0}")]
    NoCapacity(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::NoCapacity(_) => (StatusCode::SERVICE_UNAVAILABLE, "no_capacity"),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Dispatch(_) => (StatusCode::BAD_GATEWAY, "dispatch_failed"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}
