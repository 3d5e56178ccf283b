use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use serde::Serialize;

use super::error::ApiError;
use super::AppState;
use crate::session::{CloseReason, CreateRequest, SessionSummary};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreatedSession {
    id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// An empty body means "no operator, no metadata".
fn parse_create_body(body: &[u8]) -> Result<CreateRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CreateRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

pub(super) async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request = parse_create_body(&body)?;

    // Spawning forks the server; keep it off the async workers.
    let manager = state.manager.clone();
    let session = tokio::task::spawn_blocking(move || manager.create(&request))
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))??;

    tracing::info!(session = %session.id(), pid = ?session.pid(), "session created");
    Ok((
        StatusCode::CREATED,
        Json(CreatedSession {
            id: session.id().to_string(),
            created_at: session.created_at(),
            expires_at: session.expires_at(),
        }),
    ))
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.manager.list())
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let session = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::SessionNotFound(id.clone()))?;
    Ok(Json(session.summary()))
}

/// Panic stop.
pub(super) async fn session_kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    // Closing signals the child and takes the session locks; keep it off the
    // async workers.
    let manager = state.manager.clone();
    let kill_id = id.clone();
    tokio::task::spawn_blocking(move || manager.delete(&kill_id, CloseReason::PanicStop))
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))??;
    tracing::warn!(session = %id, "panic stop");
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
