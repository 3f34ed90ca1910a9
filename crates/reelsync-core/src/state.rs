//! Connection lifecycle state.

use crate::error::StateError;
use crate::observer::{ObserverId, Subject};
use std::cell::{Cell, RefCell};

/// Where a participant is in the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    /// Client socket open, waiting for `ConnectResponse`.
    ClientConnecting,
    /// Handshake accepted.
    ClientConnected,
    /// Hosting a session.
    ServerRunning,
}

/// Why a connection failed. Also carried on the wire by `ConnectResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    None,
    BindFailure,
    ConnectInvalidHost,
    ConnectTimeout,
    ConnectionLost,
    ConnectIncompatibleVersion,
    ConnectRefused,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::BindFailure => 1,
            ErrorCode::ConnectInvalidHost => 2,
            ErrorCode::ConnectTimeout => 3,
            ErrorCode::ConnectionLost => 4,
            ErrorCode::ConnectIncompatibleVersion => 5,
            ErrorCode::ConnectRefused => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ErrorCode::None,
            1 => ErrorCode::BindFailure,
            2 => ErrorCode::ConnectInvalidHost,
            3 => ErrorCode::ConnectTimeout,
            4 => ErrorCode::ConnectionLost,
            5 => ErrorCode::ConnectIncompatibleVersion,
            6 => ErrorCode::ConnectRefused,
            _ => return None,
        })
    }

    pub fn is_error(self) -> bool {
        self != ErrorCode::None
    }
}

/// An error code plus the text shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub code: ErrorCode,
    pub text: String,
}

/// Delivered to observers on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
    pub error: Option<ConnectionError>,
}

fn allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, ClientConnecting)
            | (ClientConnecting, ClientConnected)
            | (ClientConnecting, Disconnected)
            | (ClientConnected, Disconnected)
            | (Disconnected, ServerRunning)
            | (ServerRunning, Disconnected)
    )
}

/// Observable connection state with its last error.
#[derive(Debug)]
pub struct StateMachine {
    state: Cell<ConnectionState>,
    error: RefCell<Option<ConnectionError>>,
    observers: Subject<StateChange>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Cell::new(ConnectionState::Disconnected),
            error: RefCell::new(None),
            observers: Subject::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn error(&self) -> Option<ConnectionError> {
        self.error.borrow().clone()
    }

    pub fn subscribe(&self, observer: impl Fn(&StateChange) + 'static) -> ObserverId {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Move to `new`, clearing any previous error.
    ///
    /// Returns `Ok(false)` when already in `new`.
    pub fn transition(&self, new: ConnectionState) -> Result<bool, StateError> {
        let old = self.state.get();
        if old == new {
            return Ok(false);
        }
        if !allowed(old, new) {
            return Err(StateError::InvalidTransition { from: old, to: new });
        }
        self.state.set(new);
        self.error.replace(None);
        self.observers.notify(&StateChange { old, new, error: None });
        Ok(true)
    }

    /// Drop to `Disconnected` with an error.
    ///
    /// A failure that lands on an already failed machine is ignored, so racing
    /// timeouts and socket errors report once. Returns whether observers were
    /// notified.
    pub fn fail(&self, code: ErrorCode, text: impl Into<String>) -> bool {
        let old = self.state.get();
        if old == ConnectionState::Disconnected && self.error.borrow().is_some() {
            return false;
        }
        let error = ConnectionError {
            code,
            text: text.into(),
        };
        self.state.set(ConnectionState::Disconnected);
        self.error.replace(Some(error.clone()));
        self.observers.notify(&StateChange {
            old,
            new: ConnectionState::Disconnected,
            error: Some(error),
        });
        true
    }

    /// Forget the last error before a fresh attempt.
    pub fn clear_error(&self) {
        self.error.replace(None);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
