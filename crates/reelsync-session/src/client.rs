//! Client endpoint.
//!
//! A client opens one transport to a host, introduces itself with `Connect`,
//! and is connected once the server answers `ConnectResponse(None)`. From
//! then on it pings the server every heartbeat interval and considers the
//! connection lost when nothing at all has arrived for the heartbeat timeout.

use crate::config::SessionConfig;
use crate::dispatcher::MessageSink;
use crate::timer::Timer;
use crate::transport::{Inbound, Transport, TransportConfig};
use reelsync_core::{
    ConnectionState, ErrorCode, Frame, Message, MessageRegistry, ObserverId, PROTOCOL_VERSION, Payload,
    SERVER_ID, StateError, StateMachine, Subject, Target,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tokio::task::JoinHandle;

type MessageHandler = Rc<dyn Fn(Vec<Message>)>;

struct ClientInner {
    id: String,
    config: SessionConfig,
    registry: MessageRegistry,
    state: Rc<StateMachine>,
    transport: RefCell<Option<Transport>>,
    connect_task: RefCell<Option<JoinHandle<()>>>,
    ping_timer: Timer,
    receive_timer: Timer,
    handler: RefCell<Option<MessageHandler>>,
    peer_count: Cell<usize>,
    peer_count_changed: Subject<usize>,
}

/// Must be used from within a `tokio::task::LocalSet`.
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientInner>,
}

impl Client {
    pub fn new(config: SessionConfig, registry: MessageRegistry, state: Rc<StateMachine>) -> Self {
        let ping_timer = Timer::repeating(config.heartbeat_interval());
        let receive_timer = Timer::one_shot(config.heartbeat_timeout());
        Self {
            inner: Rc::new(ClientInner {
                id: uuid::Uuid::new_v4().to_string(),
                config,
                registry,
                state,
                transport: RefCell::new(None),
                connect_task: RefCell::new(None),
                ping_timer,
                receive_timer,
                handler: RefCell::new(None),
                peer_count: Cell::new(0),
                peer_count_changed: Subject::new(),
            }),
        }
    }

    fn from_weak(weak: &Weak<ClientInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    pub fn state_machine(&self) -> &Rc<StateMachine> {
        &self.inner.state
    }

    /// Receives every message the client does not handle itself.
    pub fn set_message_handler(&self, handler: impl Fn(Vec<Message>) + 'static) {
        self.inner.handler.replace(Some(Rc::new(handler)));
    }

    /// The sink a dispatcher sends through.
    pub fn sink(&self) -> Rc<dyn MessageSink> {
        self.inner.clone()
    }

    /// Participants in the session besides the host, as last announced.
    pub fn peer_count(&self) -> usize {
        self.inner.peer_count.get()
    }

    pub fn subscribe_peer_count(&self, observer: impl Fn(&usize) + 'static) -> ObserverId {
        self.inner.peer_count_changed.subscribe(observer)
    }

    pub fn unsubscribe_peer_count(&self, id: ObserverId) -> bool {
        self.inner.peer_count_changed.unsubscribe(id)
    }

    /// Start connecting. Failures surface through the state machine.
    pub fn connect_to_host(&self, host: &str, port: u16, client_data: Value) -> Result<(), StateError> {
        let state = &self.inner.state;
        if state.state() != ConnectionState::Disconnected {
            return Err(StateError::InvalidTransition {
                from: state.state(),
                to: ConnectionState::ClientConnecting,
            });
        }
        state.clear_error();
        state.transition(ConnectionState::ClientConnecting)?;
        tracing::info!(client = %self.inner.id, "connecting to {}:{}", host, port);

        // The connect timeout covers resolve, handshake and ConnectResponse.
        let weak = Rc::downgrade(&self.inner);
        self.inner.receive_timer.start(move || {
            if let Some(client) = Client::from_weak(&weak) {
                client.on_receive_timeout();
            }
        });

        let weak = Rc::downgrade(&self.inner);
        let host = host.to_string();
        let transport_config = TransportConfig::from_session(&self.inner.config);
        let task = tokio::task::spawn_local(async move {
            let result = Transport::connect(&host, port, transport_config).await;
            let Some(client) = Client::from_weak(&weak) else { return };
            client.inner.connect_task.replace(None);
            if client.state() != ConnectionState::ClientConnecting {
                return;
            }
            match result {
                Ok(transport) => client.on_transport_open(transport, client_data),
                Err(e) => {
                    tracing::warn!(client = %client.inner.id, "connection failed: {}", e);
                    client.teardown();
                    client.inner.state.fail(e.error_code(), e.to_string());
                }
            }
        });
        self.inner.connect_task.replace(Some(task));
        Ok(())
    }

    fn on_transport_open(&self, transport: Transport, client_data: Value) {
        let weak = Rc::downgrade(&self.inner);
        transport.start_reading(move |batch| {
            if let Some(client) = Client::from_weak(&weak) {
                client.on_batch(batch);
            }
        });
        self.inner.transport.replace(Some(transport));
        self.send(
            Target::Broadcast,
            Payload::Connect {
                protocol_version: PROTOCOL_VERSION.to_string(),
                application_version: self.inner.config.application_version.clone(),
                client_data,
            },
        );
    }

    fn on_batch(&self, batch: Vec<Inbound>) {
        let mut forwarded = Vec::new();
        for inbound in batch {
            if self.inner.transport.borrow().is_none() {
                return;
            }
            if self.state() == ConnectionState::ClientConnected {
                self.inner.receive_timer.restart();
            }
            let message = match self.inner.registry.deserialize(&inbound.frames) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(client = %self.inner.id, "dropping message: {}", e);
                    continue;
                }
            };
            match message.payload {
                Payload::ConnectResponse { result, response_text } => {
                    self.on_connect_response(result, response_text);
                }
                Payload::Ping {} | Payload::Pong {} => {}
                Payload::NumberOfPeers { content } => {
                    self.inner.peer_count.set(content);
                    self.inner.peer_count_changed.notify(&content);
                }
                Payload::Disconnect {} if message.sender == SERVER_ID => {
                    tracing::info!(client = %self.inner.id, "host ended the session");
                    self.teardown();
                    self.inner.state.fail(ErrorCode::ConnectionLost, "host ended the session");
                    return;
                }
                _ if self.state() == ConnectionState::ClientConnected => forwarded.push(message),
                _ => {
                    tracing::debug!(kind = %message.kind(), "ignoring message before handshake");
                }
            }
        }
        if forwarded.is_empty() {
            return;
        }
        let handler = self.inner.handler.borrow().clone();
        if let Some(handler) = handler {
            handler(forwarded);
        }
    }

    fn on_connect_response(&self, result: ErrorCode, text: String) {
        if self.state() != ConnectionState::ClientConnecting {
            tracing::debug!(client = %self.inner.id, "unexpected ConnectResponse");
            return;
        }
        if result.is_error() {
            tracing::warn!(client = %self.inner.id, code = ?result, "connection rejected: {}", text);
            self.teardown();
            self.inner.state.fail(result, text);
            return;
        }
        if let Err(e) = self.inner.state.transition(ConnectionState::ClientConnected) {
            tracing::warn!("{}", e);
            return;
        }
        tracing::info!(client = %self.inner.id, "connected");

        let weak = Rc::downgrade(&self.inner);
        self.inner.ping_timer.start(move || {
            if let Some(client) = Client::from_weak(&weak) {
                client.send(Target::client(SERVER_ID), Payload::Ping {});
            }
        });
        self.inner.receive_timer.restart();
    }

    fn on_receive_timeout(&self) {
        let (code, text) = match self.state() {
            ConnectionState::ClientConnecting => (ErrorCode::ConnectTimeout, "timed out connecting to host"),
            ConnectionState::ClientConnected => (ErrorCode::ConnectionLost, "connection to host lost"),
            _ => return,
        };
        tracing::warn!(client = %self.inner.id, "{}", text);
        self.teardown();
        self.inner.state.fail(code, text);
    }

    /// Say goodbye if connected, then tear down regardless.
    pub fn disconnect_from_host(&self) {
        let state = self.state();
        if state == ConnectionState::ClientConnected {
            self.send(Target::client(SERVER_ID), Payload::Disconnect {});
        }
        self.teardown();
        if matches!(state, ConnectionState::ClientConnecting | ConnectionState::ClientConnected) {
            if let Err(e) = self.inner.state.transition(ConnectionState::Disconnected) {
                tracing::warn!("{}", e);
            }
            tracing::info!(client = %self.inner.id, "disconnected");
        }
    }

    fn send(&self, target: Target, payload: Payload) {
        let message = Message::new(self.inner.id.clone(), target, payload);
        match self.inner.registry.serialize(&message) {
            Ok(frames) => self.inner.send_frames(frames),
            Err(e) => tracing::warn!(kind = %message.kind(), "failed to serialize: {}", e),
        }
    }

    fn teardown(&self) {
        self.inner.teardown();
    }
}

impl ClientInner {
    fn teardown(&self) {
        self.ping_timer.stop();
        self.receive_timer.stop();
        if let Some(task) = self.connect_task.borrow_mut().take() {
            task.abort();
        }
        if let Some(transport) = self.transport.borrow_mut().take() {
            transport.close();
        }
        self.peer_count.set(0);
    }
}

impl MessageSink for ClientInner {
    fn sender_id(&self) -> String {
        self.id.clone()
    }

    fn send_frames(&self, frames: Vec<Frame>) {
        match self.transport.borrow().as_ref() {
            Some(transport) => transport.send(None, &frames),
            None => tracing::debug!(client = %self.id, "not connected, dropping message"),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.teardown();
    }
}
