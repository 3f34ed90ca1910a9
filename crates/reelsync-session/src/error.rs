//! Session-level errors.

use crate::config::ConfigError;
use crate::transport::TransportError;
use reelsync_core::{ConnectionState, ErrorCode, StateError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("operation requires {expected}, current state is {actual:?}")]
    InvalidState {
        expected: &'static str,
        actual: ConnectionState,
    },
    #[error("only the host can do this")]
    NotHost,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl TransportError {
    /// The state-machine error a failed bind or connect surfaces as.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransportError::InvalidAddress { .. } => ErrorCode::ConnectInvalidHost,
            TransportError::Bind { .. } => ErrorCode::BindFailure,
            TransportError::Connect { .. } | TransportError::Handshake(_) => ErrorCode::ConnectRefused,
            TransportError::MalformedFrames(_) | TransportError::FrameTooLarge(_) => ErrorCode::ConnectionLost,
        }
    }
}
