//! Control channel vocabulary.
//!
//! Every control frame is a JSON text message tagged by `command`:
//!
//! ```text
//! {"command":"keep-alive"}
//! {"command":"conn-ready","id":"3f0c…"}        server -> agent
//! {"command":"pickup-failed","id":"3f0c…","reason":"connection refused"}   agent -> server
//! ```
//!
//! Commands this build does not know decode to [`ControlMessage::Unknown`] and
//! are ignored by both read loops, so either side can be upgraded first.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Length of a correlation ID in hex characters.
pub const CORRELATION_ID_LEN: usize = 32;

/// Maximum agent key length.
pub const MAX_KEY_LEN: usize = 128;

/// A single control-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Liveness ping; resets the peer's read-timeout clock.
    KeepAlive,
    /// Open a new data connection now and tag it with `id`.
    ConnReady { id: String },
    /// The agent could not establish the data connection for `id`.
    PickupFailed { id: String, reason: String },
    /// Any command this build does not recognise.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Parse one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> String {
        // Only unit variants and string fields, so serialization cannot fail.
        serde_json::to_string(self).expect("control message serializes")
    }

    /// The wire name of this message's command.
    pub fn command(&self) -> &'static str {
        match self {
            ControlMessage::KeepAlive => "keep-alive",
            ControlMessage::ConnReady { .. } => "conn-ready",
            ControlMessage::PickupFailed { .. } => "pickup-failed",
            ControlMessage::Unknown => "unknown",
        }
    }
}

/// Mint a fresh, unguessable correlation ID (v4 UUID, 122 random bits).
pub fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Correlation IDs are exactly [`CORRELATION_ID_LEN`] lowercase hex chars.
pub fn is_valid_correlation_id(id: &str) -> bool {
    id.len() == CORRELATION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Validate agent key format: alphanumeric, dash, underscore, dot, colon, 1-128 chars.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}
