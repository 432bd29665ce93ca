//! Error types surfaced by the registry, the dialers and the agent listener.
//!
//! Dial failures are a closed set of distinguishable variants so callers can
//! pick a retry policy; nothing in this crate retries a dial on their behalf.

use std::time::Duration;

use thiserror::Error;

/// Why a `dial()` call did not produce a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    /// No active dialer and no grace-period entry for the key.
    #[error("no connection for key '{0}'")]
    NoConnection(String),
    /// The key is in its grace period and the reconnect queue is at capacity.
    #[error("too many pending dials for key '{key}' (capacity {capacity})")]
    QueueFull { key: String, capacity: usize },
    /// No data connection arrived before the per-dial timeout.
    #[error("no data connection within {0:?}")]
    Timeout(Duration),
    /// The agent reported it could not open the data connection.
    #[error("agent could not open data connection: {reason}")]
    PickupFailed { reason: String },
    /// The caller's cancellation token fired while waiting.
    #[error("dial cancelled")]
    Cancelled,
    /// The agent did not reconnect before its grace period elapsed.
    #[error("grace period expired for key '{0}'")]
    GraceExpired(String),
    /// The dialer serving this request was closed while it was pending.
    #[error("connection closed")]
    Closed,
    /// The key was explicitly unregistered while the request was queued.
    #[error("agent '{0}' was disconnected")]
    Disconnected(String),
}

impl DialError {
    /// Whether a caller can reasonably try the same dial again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DialError::Cancelled)
    }
}

/// Rejection of a control-connection registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("invalid agent key '{0}'")]
    InvalidKey(String),
}

/// Corruption or misuse of the control channel. Always fatal to the one
/// control connection it happened on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(String),
    #[error("unexpected binary frame on control channel")]
    UnexpectedBinary,
    #[error("unexpected '{0}' message on this side of the control channel")]
    UnexpectedCommand(&'static str),
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid agent target '{0}'")]
    InvalidTarget(String),
    #[error("invalid agent key '{0}'")]
    InvalidKey(String),
    #[error("missing required setting '{0}'")]
    Missing(&'static str),
    #[error("invalid setting '{setting}': {reason}")]
    Invalid {
        setting: &'static str,
        reason: &'static str,
    },
}

/// Why the agent's control connection could not be established or ended.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid request: {0}")]
    Request(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no frame from server within {0:?}")]
    ReadTimeout(Duration),
    #[error("server closed the control connection ({0})")]
    ClosedByServer(String),
    #[error("control connection ended without a close frame")]
    Eof,
}

impl From<tokio_tungstenite::tungstenite::Error> for ListenerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ListenerError::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_cancellation_is_final() {
        assert!(!DialError::Cancelled.is_retryable());
        assert!(DialError::NoConnection("a".into()).is_retryable());
        assert!(DialError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(DialError::GraceExpired("a".into()).is_retryable());
    }

    #[test]
    fn test_messages_are_diagnosable() {
        let err = DialError::QueueFull {
            key: "runner-7".into(),
            capacity: 4,
        };
        assert!(err.to_string().contains("too many pending dials"));
        assert!(DialError::NoConnection("b".into())
            .to_string()
            .contains("no connection for key"));
        assert!(DialError::GraceExpired("b".into())
            .to_string()
            .contains("grace period expired"));
        assert_eq!(DialError::Closed.to_string(), "connection closed");
    }
}
