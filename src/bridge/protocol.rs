//! Wire protocol for the client-facing WebSocket endpoints
//!
//! Frames are JSON text tagged by `type` (terminal) or `action` (control
//! API). Terminal output travels as `data` messages, or as raw binary frames
//! for clients that ask for them in `connectToHost`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ssh::{ErrorKind, HostConfig};
use crate::tunnel::TunnelEvent;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed control frame: {0}")]
    Malformed(String),

    #[error("Unexpected binary frame")]
    UnexpectedBinary,
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ProtocolViolation
    }
}

// ============================================================================
// Terminal endpoint (/ssh)
// ============================================================================

/// Frames sent by a terminal client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    ConnectToHost {
        cols: u32,
        rows: u32,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        host_id: Option<String>,
        #[serde(default)]
        host_config: Option<HostConfig>,
        /// Shell output as binary frames instead of `data` messages
        #[serde(default)]
        binary: bool,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u32,
        rows: u32,
        #[serde(default)]
        width: u32,
        #[serde(default)]
        height: u32,
    },
    Ping,
    Disconnect,
}

/// Frames sent to a terminal client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Shell output
    Data { data: String },
    #[serde(rename_all = "camelCase")]
    Connected { session_id: String },
    Error { message: String, kind: ErrorKind },
    Disconnected { reason: String },
    Pong,
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decodes shell output chunk by chunk. A multi-byte character split across
/// chunks is held back until its remaining bytes arrive; invalid bytes
/// become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let complete = complete_prefix_len(&self.pending);
        let rest = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }
}

/// Length of `bytes` without a trailing, cut-off UTF-8 sequence
fn complete_prefix_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back {
            bytes.len() - back
        } else {
            bytes.len()
        };
    }
    bytes.len()
}

// ============================================================================
// Control endpoint (/api)
// ============================================================================

/// Request envelope: `{ "requestId": "...", "action": "...", ...params }`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub request_id: String,
    #[serde(flatten)]
    pub action: ApiAction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ApiAction {
    #[serde(rename_all = "camelCase")]
    TunnelStart { tunnel_id: String },
    #[serde(rename_all = "camelCase")]
    TunnelStop { tunnel_id: String },
    #[serde(rename_all = "camelCase")]
    TunnelRestart { tunnel_id: String },
    #[serde(rename_all = "camelCase")]
    TunnelState { tunnel_id: String },
    TunnelList,

    #[serde(rename_all = "camelCase")]
    FileList {
        session_id: String,
        host_id: String,
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    FileRename {
        session_id: String,
        host_id: String,
        path: String,
        new_name: String,
    },
    #[serde(rename_all = "camelCase")]
    FileDelete {
        session_id: String,
        host_id: String,
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    /// Streams `fileChunk` pushes, then answers with the byte count
    #[serde(rename_all = "camelCase")]
    FileRead {
        session_id: String,
        host_id: String,
        path: String,
    },
    /// Opens an upload; content follows as `fileWriteChunk` frames carrying
    /// the same request id and ends with `fileWriteEnd`
    #[serde(rename_all = "camelCase")]
    FileWrite {
        session_id: String,
        host_id: String,
        path: String,
    },
    FileWriteChunk {
        data: String,
    },
    FileWriteEnd,

    #[serde(rename_all = "camelCase")]
    HostStatus { host_id: String },
    #[serde(rename_all = "camelCase")]
    HostMetrics { host_id: String },
    #[serde(rename_all = "camelCase")]
    SessionStatus { session_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub message: String,
    pub kind: ErrorKind,
}

/// Frames pushed on the control endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ApiMessage {
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: Option<String>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ApiError>,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        request_id: String,
        offset: u64,
        data: String,
    },
    TunnelEvent(TunnelEvent),
}

impl ApiMessage {
    pub fn ok(request_id: &str, result: Value) -> Self {
        ApiMessage::Response {
            request_id: Some(request_id.to_string()),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(request_id: Option<&str>, message: impl Into<String>, kind: ErrorKind) -> Self {
        ApiMessage::Response {
            request_id: request_id.map(str::to_string),
            ok: false,
            result: None,
            error: Some(ApiError {
                message: message.into(),
                kind,
            }),
        }
    }
}

pub fn parse_api_request(text: &str) -> Result<ApiRequest, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Best-effort request id recovery from a frame that failed to parse
pub fn salvage_request_id(text: &str) -> Option<String> {
    serde_json::from_str::<Value>(text)
        .ok()?
        .get("requestId")?
        .as_str()
        .map(str::to_string)
}
