use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::manager::ManagerError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 429 - Every admission slot is held by a live session.
    CapacityReached(usize),
    /// 404 - No live session with this id.
    SessionNotFound(String),
    /// 400 - Malformed or invalid request body.
    InvalidRequest(String),
    /// 500 - Transcript or PTY setup failed.
    SessionCreateFailed(String),
    /// 403 - Proxy guard is on and forwarding headers are missing.
    ProxyHeadersRequired,
    /// 500 - WebSocket handshake could not be completed.
    UpgradeFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::CapacityReached(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionCreateFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ProxyHeadersRequired => StatusCode::FORBIDDEN,
            ApiError::UpgradeFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::CapacityReached(_) => "capacity_reached",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::SessionCreateFailed(_) => "session_create_failed",
            ApiError::ProxyHeadersRequired => "proxy_headers_required",
            ApiError::UpgradeFailed(_) => "upgrade_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::CapacityReached(max) => {
                format!("capacity reached: {} concurrent sessions already running.", max)
            }
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::SessionCreateFailed(detail) => {
                format!("Failed to create session: {}.", detail)
            }
            ApiError::ProxyHeadersRequired => {
                "X-Forwarded-For and X-Forwarded-Proto headers are required.".to_string()
            }
            ApiError::UpgradeFailed(detail) => format!("WebSocket upgrade failed: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::CapacityReached(max) => ApiError::CapacityReached(max),
            ManagerError::NotFound(id) => ApiError::SessionNotFound(id),
            ManagerError::Session(e) => ApiError::SessionCreateFailed(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
