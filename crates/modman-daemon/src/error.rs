//! Error types for modmand

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use modman_types::ErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Another orchestration operation holds the lease
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<modman_types::Error> for ApiError {
    fn from(err: modman_types::Error) -> Self {
        let message = err.message().to_string();
        match err.kind() {
            ErrorKind::NotFound => ApiError::NotFound(message),
            ErrorKind::InvalidInput => ApiError::BadRequest(message),
            ErrorKind::ResourceBusy => ApiError::Conflict(message),
            ErrorKind::Forbidden => ApiError::Forbidden(message),
            ErrorKind::Internal => ApiError::Internal(message),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "RESOURCE_BUSY"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            details: None,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;
    use modman_types::Error;

    #[test]
    fn test_api_error_status_codes() {
        let cases = [
            (Error::not_found("x"), StatusCode::NOT_FOUND),
            (Error::invalid_input("x"), StatusCode::BAD_REQUEST),
            (Error::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::busy("x"), StatusCode::CONFLICT),
            (Error::Forbidden("x".to_string()), StatusCode::FORBIDDEN),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_message_keeps_context() {
        let err = Error::not_found("deployment 42").context("start deployment (42)");
        let api = ApiError::from(err);
        assert_eq!(
            api.to_string(),
            "Not found: start deployment (42): deployment 42"
        );
    }
}
