//! The event-loop side of reelsync.
//!
//! Everything here runs on one thread: a tokio current-thread runtime driving
//! a `LocalSet`. The transport moves frame sets over WebSockets, the client
//! and server speak the handshake and heartbeat protocol on top of it, and a
//! [`Session`] connects a [`MessageDispatcher`] to the sync tools that keep
//! each participant's copy of the editing model in step. [`ConnectionManager`]
//! is the entry point an application talks to.
//!
//! The application model itself is external and reached through the traits
//! in [`model`]; [`memory`] provides an in-memory implementation.

mod client;
mod config;
mod dispatcher;
mod error;
mod manager;
pub mod memory;
pub mod model;
mod server;
mod session;
mod timer;
pub mod tools;
mod transport;

pub use client::Client;
pub use config::{ConfigError, SessionConfig};
pub use dispatcher::{CallbackId, Handler, MessageDispatcher, MessageSink, WeakDispatcher};
pub use error::SessionError;
pub use manager::ConnectionManager;
pub use server::Server;
pub use session::{Role, Session};
pub use timer::Timer;
pub use transport::{
    Inbound, PeerIdentity, Transport, TransportConfig, TransportError, decode_frames, encode_frames,
};
