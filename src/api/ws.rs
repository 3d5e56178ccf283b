use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Path, State,
    },
    response::Response,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};

use super::error::ApiError;
use super::AppState;
use crate::broker::Client;
use crate::protocol::{parse_inbound, Envelope, Inbound, Status};
use crate::session::Session;

const WS_BUFFER_SIZE: usize = 4096;

/// A single frame write that takes longer than this disconnects the client.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /sessions/{id}/stream`.
///
/// An unknown id is a plain 404 and is not counted as a failed upgrade.
pub(super) async fn session_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let session = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::SessionNotFound(id.clone()))?;

    let ws = ws.map_err(|e| {
        state.metrics.upgrade_failed();
        tracing::warn!(session = %id, error = %e.body_text(), "websocket upgrade rejected");
        ApiError::UpgradeFailed(e.body_text())
    })?;

    let metrics = state.metrics.clone();
    Ok(ws
        .read_buffer_size(WS_BUFFER_SIZE)
        .write_buffer_size(WS_BUFFER_SIZE)
        .on_failed_upgrade(move |e| {
            metrics.upgrade_failed();
            tracing::warn!(?e, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_stream(socket, session)))
}

async fn handle_stream(socket: WebSocket, session: Arc<Session>) {
    let client = Client::new();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Queued before attaching so it is always the first frame.
    client.enqueue(Envelope::status(Status::Connected, None, Utc::now()));
    if !session.add_client(client.clone()) {
        tracing::debug!(session = %session.id(), "attach refused, session closed");
        client.abort();
        let _ = ws_tx.send(Message::Close(Some(normal_close()))).await;
        return;
    }
    tracing::info!(session = %session.id(), client = client.id(), "client attached");

    let writer = {
        let client = client.clone();
        tokio::spawn(async move {
            while let Some(env) = client.recv().await {
                let frame = Message::Text(env.to_json().into());
                match tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(client = client.id(), ?e, "websocket write failed");
                        client.abort();
                        return;
                    }
                    Err(_) => {
                        tracing::warn!(client = client.id(), "websocket write timed out");
                        client.abort();
                        return;
                    }
                }
            }
            let close = Message::Close(Some(normal_close()));
            let _ = tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(close)).await;
        })
    };

    loop {
        tokio::select! {
            _ = client.cancelled().cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&session, &client, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(client = client.id(), ?e, "websocket read failed");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    client.close();
    session.remove_client(client.id());
    let _ = writer.await;
    tracing::info!(session = %session.id(), client = client.id(), "client detached");
}

async fn dispatch(session: &Arc<Session>, client: &Arc<Client>, text: &str) {
    match parse_inbound(text) {
        Inbound::Input(data) => {
            let session = session.clone();
            match tokio::task::spawn_blocking(move || session.handle_input(&data)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(?e, "input dropped"),
                Err(e) => tracing::warn!(?e, "input task failed"),
            }
        }
        Inbound::Resize(size) => {
            if size.cols == 0 || size.rows == 0 {
                return;
            }
            if let Err(e) = session.resize(size.cols, size.rows) {
                tracing::debug!(?e, "resize dropped");
            }
        }
        Inbound::Heartbeat => {
            session.touch();
            client.enqueue(Envelope::heartbeat(Utc::now()));
        }
        Inbound::Ignored => {}
    }
}

fn normal_close() -> CloseFrame {
    CloseFrame {
        code: close_code::NORMAL,
        reason: "session closed".into(),
    }
}
