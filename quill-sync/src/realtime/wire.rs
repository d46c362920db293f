//! Binary protocol spoken with the realtime document backend.
//!
//! Wire format (bincode-encoded, one WebSocket binary frame per message):
//! ```text
//! ┌──────┬────────────┬────────────┬────────┬─────────┬─────────┐
//! │ kind │ request_id │ collection │ doc_id │ version │ payload │
//! │ 1 B  │ varint     │ string     │ string │ varint  │ bytes   │
//! └──────┴────────────┴────────────┴────────┴─────────┴─────────┘
//! ```
//!
//! `request_id` correlates a reply (`snapshot`, `ack`, `error`) with its
//! request; 0 marks unsolicited traffic such as remote `op`s. Payloads of
//! `snapshot`, `submit` and `op` are JSON documents / JSON merge patches.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kinds on the backend link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DocMessageKind {
    /// Fetch the current snapshot and start receiving ops for the document.
    Subscribe = 1,
    /// Snapshot reply to a subscribe
    Snapshot = 2,
    /// Stop receiving ops
    Unsubscribe = 3,
    /// Submit a merge patch against a base version
    Submit = 4,
    /// Submit accepted; `version` is the new document version
    Ack = 5,
    /// Change made by another client
    Op = 6,
    /// Request failed; payload is a UTF-8 reason
    Error = 7,
    Ping = 8,
    Pong = 9,
}

/// Top-level backend message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMessage {
    pub kind: DocMessageKind,
    pub request_id: u64,
    pub collection: String,
    pub doc_id: String,
    pub version: u64,
    pub payload: Vec<u8>,
}

impl DocMessage {
    fn bare(kind: DocMessageKind, request_id: u64, collection: &str, doc_id: &str) -> Self {
        Self {
            kind,
            request_id,
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            version: 0,
            payload: Vec::new(),
        }
    }

    pub fn subscribe(request_id: u64, collection: &str, doc_id: &str) -> Self {
        Self::bare(DocMessageKind::Subscribe, request_id, collection, doc_id)
    }

    pub fn unsubscribe(collection: &str, doc_id: &str) -> Self {
        Self::bare(DocMessageKind::Unsubscribe, 0, collection, doc_id)
    }

    pub fn snapshot(
        request_id: u64,
        collection: &str,
        doc_id: &str,
        version: u64,
        data: &Value,
    ) -> Result<Self, WireError> {
        Ok(Self {
            version,
            payload: json_bytes(data)?,
            ..Self::bare(DocMessageKind::Snapshot, request_id, collection, doc_id)
        })
    }

    pub fn submit(
        request_id: u64,
        collection: &str,
        doc_id: &str,
        base_version: u64,
        patch: &Value,
    ) -> Result<Self, WireError> {
        Ok(Self {
            version: base_version,
            payload: json_bytes(patch)?,
            ..Self::bare(DocMessageKind::Submit, request_id, collection, doc_id)
        })
    }

    pub fn ack(request_id: u64, collection: &str, doc_id: &str, version: u64) -> Self {
        Self {
            version,
            ..Self::bare(DocMessageKind::Ack, request_id, collection, doc_id)
        }
    }

    /// A remote change; `version` is the document version after the patch.
    pub fn op(
        collection: &str,
        doc_id: &str,
        version: u64,
        patch: &Value,
    ) -> Result<Self, WireError> {
        Ok(Self {
            version,
            payload: json_bytes(patch)?,
            ..Self::bare(DocMessageKind::Op, 0, collection, doc_id)
        })
    }

    pub fn error(request_id: u64, collection: &str, doc_id: &str, reason: &str) -> Self {
        Self {
            payload: reason.as_bytes().to_vec(),
            ..Self::bare(DocMessageKind::Error, request_id, collection, doc_id)
        }
    }

    pub fn ping() -> Self {
        Self::bare(DocMessageKind::Ping, 0, "", "")
    }

    pub fn pong() -> Self {
        Self::bare(DocMessageKind::Pong, 0, "", "")
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| WireError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| WireError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the JSON payload of a snapshot, submit or op.
    pub fn json_payload(&self) -> Result<Value, WireError> {
        match self.kind {
            DocMessageKind::Snapshot | DocMessageKind::Submit | DocMessageKind::Op => {
                serde_json::from_slice(&self.payload)
                    .map_err(|e| WireError::Deserialization(e.to_string()))
            }
            other => Err(WireError::InvalidKind(other)),
        }
    }

    /// Reason carried by an error reply.
    pub fn error_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

fn json_bytes(value: &Value) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(value).map_err(|e| WireError::Serialization(e.to_string()))
}

/// Backend wire errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("message kind {0:?} has no JSON payload")]
    InvalidKind(DocMessageKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_roundtrip() {
        let msg = DocMessage::subscribe(12, "projects", "p1");
        let decoded = DocMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind, DocMessageKind::Subscribe);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_snapshot_carries_json() {
        let data = json!({"name": "Project One", "texts": []});
        let msg = DocMessage::snapshot(3, "projects", "p1", 7, &data).unwrap();
        let decoded = DocMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.version, 7);
        assert_eq!(decoded.json_payload().unwrap(), data);
    }

    #[test]
    fn test_error_reason() {
        let msg = DocMessage::error(5, "texts", "p1:40:1:target", "version conflict");
        assert_eq!(msg.error_reason(), "version conflict");
        assert_eq!(msg.json_payload(), Err(WireError::InvalidKind(DocMessageKind::Error)));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(DocMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_kind_values() {
        assert_eq!(DocMessageKind::Subscribe as u8, 1);
        assert_eq!(DocMessageKind::Op as u8, 6);
        assert_eq!(DocMessageKind::Pong as u8, 9);
    }

    #[test]
    fn test_small_frames_stay_small() {
        let ping = DocMessage::ping().encode().unwrap();
        assert!(ping.len() < 16, "ping frame is {} bytes", ping.len());
    }
}
