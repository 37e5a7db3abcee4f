//! Wire protocol for the change relay.
//!
//! Every frame on a relay socket is a bincode-encoded [`Frame`]:
//! ```text
//! ┌─────────┬─────────────────────────────────────────────┐
//! │ tag     │ fields                                      │
//! │ varint  │ Join:  doc_id, user_id                      │
//! │         │ Edit:  doc_id, content, sender, timestamp   │
//! │         │ Ping / Pong: empty                          │
//! └─────────┴─────────────────────────────────────────────┘
//! ```
//!
//! Change messages carry the whole document body after an edit. The relay
//! keeps no history: a frame that reaches no live subscriber is gone, and
//! the periodic store poll is what brings late readers back in line.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alphabet for shareable document codes: uppercase plus digits.
const DOC_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a generated document code.
pub const DOC_ID_LEN: usize = 6;

/// A whole-document change, as published to and fanned out by the relay.
///
/// `content` is the full body after the edit, not a diff. Consistency is
/// last-write-wins on the persisted record, so messages are never ordered
/// or replayed. `timestamp` is milliseconds since the Unix epoch and is
/// restamped by the relay server when it accepts the frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeMessage {
    pub doc_id: String,
    pub content: String,
    /// Client identity of the publisher; the relay uses it to keep a
    /// publisher's own edits out of its subscription.
    pub sender: String,
    pub timestamp: u64,
}

impl ChangeMessage {
    /// Create a change stamped with the current wall clock.
    pub fn new(
        doc_id: impl Into<String>,
        content: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            content: content.into(),
            sender: sender.into(),
            timestamp: now_ms(),
        }
    }

    /// Create with an explicit timestamp (for restamping and tests).
    pub fn with_timestamp(
        doc_id: impl Into<String>,
        content: impl Into<String>,
        sender: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            content: content.into(),
            sender: sender.into(),
            timestamp,
        }
    }
}

/// Top-level relay frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    /// Register interest in one document's change feed.
    Join { doc_id: String, user_id: String },
    /// A document change to fan out.
    Edit(ChangeMessage),
    /// Heartbeat ping.
    Ping,
    /// Heartbeat pong.
    Pong,
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a shareable document code (6 chars, A-Z0-9).
///
/// Entropy comes from a v4 UUID. 36^6 is about 2.1 billion codes, enough
/// for collision-free assignment at realistic document counts.
pub fn new_doc_id() -> String {
    let mut bits = Uuid::new_v4().as_u128();
    let mut code = String::with_capacity(DOC_ID_LEN);
    for _ in 0..DOC_ID_LEN {
        let idx = (bits % DOC_ID_ALPHABET.len() as u128) as usize;
        code.push(DOC_ID_ALPHABET[idx] as char);
        bits /= DOC_ID_ALPHABET.len() as u128;
    }
    code
}
