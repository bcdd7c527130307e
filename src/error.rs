//! API error type shared by every HTTP handler and the WebSocket accept path.
//!
//! Authorization and validation failures short-circuit before any database
//! write; storage failures inside the relay logging paths are swallowed at
//! the call site and never reach this type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed input: bad device type, bad SIM slot, out-of-range body,
    /// duplicate username, invalid pairing code.
    #[error("{0}")]
    BadRequest(String),

    /// Missing, invalid, or expired bearer token; wrong credentials.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not allowed: foreign device, unpaired relay,
    /// cross-account pairing code.
    #[error("{0}")]
    Forbidden(String),

    /// Device or pairing code does not exist (expired codes included).
    #[error("{0}")]
    NotFound(String),

    /// Sliding-window limit hit for this key.
    #[error("Too many attempts, try again later")]
    RateLimited,

    /// Endpoint depends on configuration that is absent (e.g. Google login
    /// without GOOGLE_CLIENT_ID).
    #[error("{0}")]
    NotConfigured(String),

    /// The target session is registered but the channel send failed.
    #[error("Failed to deliver to the connected device")]
    DeliveryFailed,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::DeliveryFailed => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal errors may carry paths or SQL detail — log them, return
        // a generic message to the caller.
        let message = match &self {
            ApiError::Internal(e) => {
                error!(err = %e, "internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(e.into())
    }
}
