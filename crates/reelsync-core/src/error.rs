//! Error types for the protocol layer.

use crate::state::ConnectionState;

/// A frame set could not be turned into a message, or the reverse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("malformed {kind} message: {reason}")]
    MalformedMessage { kind: String, reason: String },
}

impl ProtocolError {
    pub(crate) fn malformed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

/// A single field could not be encoded or decoded by its codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("expected a {expected} value, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("field is not valid utf-8")]
    InvalidUtf8,
    #[error("invalid boolean field: {0:?}")]
    InvalidBool(String),
    #[error("invalid number field: {0:?}")]
    InvalidNumber(String),
    #[error("invalid json field: {0}")]
    Json(String),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("compressed field is truncated")]
    Truncated,
    #[error("compressed field declares {declared} bytes but holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown error code {0}")]
    UnknownErrorCode(i32),
}

/// A connection state change that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("invalid connection state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}
