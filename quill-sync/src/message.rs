//! IPC message protocol between the host and its worker process.
//!
//! Wire format: one JSON object per line.
//! ```text
//! {"id":3,"timestamp":1718000000123,"type":"projectResults","projects":["p1","p2"]}
//! ```
//!
//! `id` increases strictly per sender and is only used for correlation and
//! debugging; both ends count independently, so ids are not unique across
//! the channel. The set of `type`s is closed: adding one is a compile error
//! at every `match` on [`MessageBody`]. A receiver that sees a `type` it does
//! not know gets [`Incoming::Unknown`] and should warn, not fail.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Credentials and endpoints the host hands to the worker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Opaque bearer credential.
    pub auth_token: String,
    pub http_base_url: String,
    pub ws_base_url: String,
    pub control_plane_port: u16,
}

impl fmt::Debug for InitializeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializeParams")
            .field("auth_token", &"<redacted>")
            .field("http_base_url", &self.http_base_url)
            .field("ws_base_url", &self.ws_base_url)
            .field("control_plane_port", &self.control_plane_port)
            .finish()
    }
}

/// Type-specific payload. The serde tag is the wire `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageBody {
    Initialize(InitializeParams),
    Ping,
    Pong,
    GetProjects,
    ProjectResults {
        projects: Vec<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Discriminant of [`MessageBody`], for logging and gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Initialize,
    Ping,
    Pong,
    GetProjects,
    ProjectResults,
    Error,
    Shutdown,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Initialize,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::GetProjects,
        MessageKind::ProjectResults,
        MessageKind::Error,
        MessageKind::Shutdown,
    ];

    /// The wire `type` string.
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Initialize => "initialize",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::GetProjects => "getProjects",
            MessageKind::ProjectResults => "projectResults",
            MessageKind::Error => "error",
            MessageKind::Shutdown => "shutdown",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether a late message of this kind may be dropped. Handshake,
    /// initialize and shutdown are acted on whatever their age.
    pub const fn expires(self) -> bool {
        !matches!(
            self,
            MessageKind::Ping | MessageKind::Pong | MessageKind::Initialize | MessageKind::Shutdown
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Initialize(_) => MessageKind::Initialize,
            MessageBody::Ping => MessageKind::Ping,
            MessageBody::Pong => MessageKind::Pong,
            MessageBody::GetProjects => MessageKind::GetProjects,
            MessageBody::ProjectResults { .. } => MessageKind::ProjectResults,
            MessageBody::Error { .. } => MessageKind::Error,
            MessageBody::Shutdown { .. } => MessageKind::Shutdown,
        }
    }

    /// Build an `error` body from a message with no stack.
    pub fn error(message: impl Into<String>) -> Self {
        MessageBody::Error {
            message: message.into(),
            stack: None,
        }
    }
}

/// A stamped IPC message. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    /// Creation instant, epoch milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Narrow on kind. Prefer matching on `body` when the payload is needed.
    pub fn is(&self, kind: MessageKind) -> bool {
        self.kind() == kind
    }

    /// Saturates: timestamps come from the peer and may be anything.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp)
    }

    /// Whether the message sat around longer than `threshold`.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.is_stale_at(now_ms(), threshold)
    }

    pub fn is_stale_at(&self, now_ms: i64, threshold: Duration) -> bool {
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        self.age_ms(now_ms) > threshold_ms
    }

    /// Serialize to a single JSON line (without the trailing newline).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Stamps outgoing messages with a strictly increasing id and the current time.
#[derive(Debug)]
pub struct MessageEncoder {
    next_id: AtomicU64,
}

impl Default for MessageEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageEncoder {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn encode(&self, body: MessageBody) -> Message {
        Message {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: now_ms(),
            body,
        }
    }
}

/// A decoded line from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Message(Message),
    /// Well-formed frame with a `type` outside the known set.
    Unknown {
        type_name: String,
        id: Option<u64>,
    },
}

/// Decode one JSON line.
pub fn decode_line(line: &str) -> Result<Incoming, ProtocolError> {
    match serde_json::from_str::<Message>(line) {
        Ok(msg) => Ok(Incoming::Message(msg)),
        Err(e) => {
            let value: serde_json::Value = serde_json::from_str(line)
                .map_err(|_| ProtocolError::Malformed(e.to_string()))?;
            match value.get("type").and_then(serde_json::Value::as_str) {
                Some(name) if MessageKind::from_wire(name).is_none() => Ok(Incoming::Unknown {
                    type_name: name.to_string(),
                    id: value.get("id").and_then(serde_json::Value::as_u64),
                }),
                _ => Err(ProtocolError::Malformed(e.to_string())),
            }
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// IPC protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("IPC channel closed")]
    ChannelClosed,
}
