use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("no backend servers available")]
    NoServersAvailable,

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("backend transport error: {0}")]
    BackendTransport(String),

    #[error("backend request timed out")]
    BackendTimeout,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("backend already registered: {0}")]
    DuplicateBackend(String),

    #[error("backend not found: {0}")]
    BackendNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BalancerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BalancerError::NoServersAvailable => StatusCode::SERVICE_UNAVAILABLE,
            BalancerError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            BalancerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            BalancerError::BackendTransport(_) => StatusCode::BAD_GATEWAY,
            BalancerError::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            BalancerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BalancerError::DuplicateBackend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BalancerError::BackendNotFound(_) => StatusCode::NOT_FOUND,
            BalancerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BalancerError::NoServersAvailable => "NO_SERVERS_AVAILABLE",
            BalancerError::CircuitOpen => "CIRCUIT_OPEN",
            BalancerError::RateLimited => "RATE_LIMIT_EXCEEDED",
            BalancerError::BackendTransport(_) => "BACKEND_TRANSPORT_ERROR",
            BalancerError::BackendTimeout => "BACKEND_TIMEOUT",
            BalancerError::BadRequest(_) => "BAD_REQUEST",
            BalancerError::DuplicateBackend(_) => "DUPLICATE_BACKEND",
            BalancerError::BackendNotFound(_) => "BACKEND_NOT_FOUND",
            BalancerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for BalancerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BalancerError>;
