//! Core types for reelsync.
//!
//! This crate provides the protocol primitives shared by every participant in
//! a collaborative editing session: the message model and its wire codecs, the
//! message registry, the connection state machine, and the small building
//! blocks (observers, remote guards, filters) the session layer is built from.
//! Nothing here touches a socket or a runtime.

mod error;
mod filter;
mod guard;
mod guid;
mod message;
mod observer;
mod registry;
mod state;

pub use error::{CodecError, ProtocolError, StateError};
pub use filter::{MessageFilter, RemoveDuplicateMessagesFilter, apply_filters};
pub use guard::{RemoteGuard, RemoteScope};
pub use guid::Guid;
pub use message::{
    BROADCAST, Codec, Field, FieldSpec, FieldValue, Frame, Message, MessageKind, Payload, Target,
};
pub use observer::{ObserverId, Subject};
pub use registry::{Header, MessageRegistry, RegistryBuilder};
pub use state::{ConnectionError, ConnectionState, ErrorCode, StateChange, StateMachine};

/// Version of the wire protocol spoken by this crate.
///
/// Sent in every `Connect`; a server rejects peers that speak another version.
pub const PROTOCOL_VERSION: &str = "1";

/// Sender id the server stamps on the messages it originates.
pub const SERVER_ID: &str = "server";
