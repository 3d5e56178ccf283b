//! WebSocket envelope format, shared by both directions.
//!
//! Every frame is a JSON object `{"type": ..., "payload": {...}}`. The
//! server ignores types it does not understand.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transcript::rfc3339;

pub const TYPE_INPUT: &str = "input";
pub const TYPE_OUTPUT: &str = "output";
pub const TYPE_RESIZE: &str = "resize";
pub const TYPE_HEARTBEAT: &str = "heartbeat";
pub const TYPE_STATUS: &str = "status";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: &str, payload: impl Serialize) -> Self {
        Self {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn status(status: Status, reason: Option<&str>, at: DateTime<Utc>) -> Self {
        Self::new(
            TYPE_STATUS,
            StatusPayload {
                status,
                reason: reason.map(str::to_string),
                timestamp: rfc3339(at),
            },
        )
    }

    pub fn heartbeat(at: DateTime<Utc>) -> Self {
        Self::new(
            TYPE_HEARTBEAT,
            HeartbeatPayload {
                timestamp: rfc3339(at),
            },
        )
    }

    pub fn output(payload: OutputPayload) -> Self {
        Self::new(TYPE_OUTPUT, payload)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Connected,
    Started,
    Closed,
    CommandExitError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub data: String,
    pub encoding: String,
    pub direction: String,
    pub timestamp: String,
}

impl OutputPayload {
    pub fn stdout(data: &[u8], at: DateTime<Utc>) -> Self {
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(data),
            encoding: "base64".to_string(),
            direction: "stdout".to_string(),
            timestamp: rfc3339(at),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InputPayload {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub encoding: String,
}

impl InputPayload {
    /// Bytes to write to the PTY, or `None` when the frame should be
    /// dropped (unknown encoding or invalid base64).
    pub fn decode(&self) -> Option<Vec<u8>> {
        match self.encoding.as_str() {
            "" | "utf-8" | "utf8" => Some(self.data.as_bytes().to_vec()),
            "base64" => base64::engine::general_purpose::STANDARD
                .decode(self.data.as_bytes())
                .ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ResizePayload {
    pub cols: u16,
    pub rows: u16,
}

/// A client frame after parsing, dispatched by the gateway read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Input(Vec<u8>),
    Resize(ResizePayload),
    Heartbeat,
    Ignored,
}

/// Parse one text frame. Malformed JSON, unknown types, and payloads that
/// fail to decode all come back as [`Inbound::Ignored`].
pub fn parse_inbound(text: &str) -> Inbound {
    let Ok(env) = serde_json::from_str::<Envelope>(text) else {
        return Inbound::Ignored;
    };
    match env.kind.as_str() {
        TYPE_INPUT => serde_json::from_value::<InputPayload>(env.payload)
            .ok()
            .and_then(|p| p.decode())
            .map_or(Inbound::Ignored, Inbound::Input),
        TYPE_RESIZE => serde_json::from_value::<ResizePayload>(env.payload)
            .map_or(Inbound::Ignored, Inbound::Resize),
        TYPE_HEARTBEAT => Inbound::Heartbeat,
        _ => Inbound::Ignored,
    }
}
