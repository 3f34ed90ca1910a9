//! Server endpoint.
//!
//! The server admits clients through the `Connect` handshake, tracks their
//! liveness, and routes everything else: broadcasts go to every client but
//! the sender, directed messages only to their target. Routed messages are
//! forwarded as raw frames; only the header is decoded.

use crate::config::SessionConfig;
use crate::timer::Timer;
use crate::transport::{Inbound, PeerIdentity, Transport, TransportConfig};
use reelsync_core::{
    ConnectionState, ErrorCode, Frame, Header, Message, MessageKind, MessageRegistry, PROTOCOL_VERSION, Payload,
    SERVER_ID, StateError, StateMachine, Target,
};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

/// A client that completed the handshake.
struct ClientConnection {
    identity: PeerIdentity,
    heartbeat: Timer,
    /// The client's own `Connect`, replayed to later arrivals.
    connect_frames: Vec<Frame>,
    joined: u64,
}

struct ServerInner {
    config: SessionConfig,
    registry: MessageRegistry,
    state: Rc<StateMachine>,
    transport: RefCell<Option<Transport>>,
    clients: RefCell<BTreeMap<String, ClientConnection>>,
    loopback: RefCell<Option<String>>,
    joined: Cell<u64>,
}

/// Must be used from within a `tokio::task::LocalSet`.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    pub fn new(config: SessionConfig, registry: MessageRegistry, state: Rc<StateMachine>) -> Self {
        Self {
            inner: Rc::new(ServerInner {
                config,
                registry,
                state,
                transport: RefCell::new(None),
                clients: RefCell::new(BTreeMap::new()),
                loopback: RefCell::new(None),
                joined: Cell::new(0),
            }),
        }
    }

    fn from_weak(weak: &Weak<ServerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.borrow().as_ref().and_then(Transport::local_addr)
    }

    /// Ids of every admitted client, the loopback one included.
    pub fn client_ids(&self) -> Vec<String> {
        let clients = self.inner.clients.borrow();
        let mut ids: Vec<_> = clients.iter().collect();
        ids.sort_by_key(|(_, connection)| connection.joined);
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }

    /// The host's own client, left out of the peer count.
    pub fn set_loopback(&self, client_id: Option<String>) {
        self.inner.loopback.replace(client_id);
    }

    /// Bind `port` and start serving. A bind failure is reported through
    /// the state machine, not returned.
    pub async fn start(&self, port: u16) -> Result<(), StateError> {
        let state = &self.inner.state;
        if state.state() != ConnectionState::Disconnected {
            return Err(StateError::InvalidTransition {
                from: state.state(),
                to: ConnectionState::ServerRunning,
            });
        }
        state.clear_error();
        let addr = SocketAddr::new(self.inner.config.bind_address, port);
        let transport = match Transport::bind(addr, TransportConfig::from_session(&self.inner.config)).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("server failed to start: {}", e);
                state.fail(e.error_code(), e.to_string());
                return Ok(());
            }
        };
        if state.state() != ConnectionState::Disconnected {
            transport.close();
            return Err(StateError::InvalidTransition {
                from: state.state(),
                to: ConnectionState::ServerRunning,
            });
        }

        let weak = Rc::downgrade(&self.inner);
        transport.start_reading(move |batch| {
            if let Some(server) = Server::from_weak(&weak) {
                server.on_batch(batch);
            }
        });
        self.inner.transport.replace(Some(transport));
        state.transition(ConnectionState::ServerRunning)?;
        Ok(())
    }

    fn on_batch(&self, batch: Vec<Inbound>) {
        for inbound in batch {
            if self.inner.transport.borrow().is_none() {
                return;
            }
            let Some(peer) = inbound.peer else { continue };
            let header = match self.inner.registry.decode_header(&inbound.frames) {
                Ok(header) => header,
                Err(e) => {
                    tracing::warn!(peer = %peer, "dropping message: {}", e);
                    continue;
                }
            };
            let known = self.touch(&header.sender, &peer);
            match header.kind {
                MessageKind::Connect => self.on_connect(peer, inbound.frames),
                _ if !known => {
                    tracing::warn!(peer = %peer, sender = %header.sender, kind = %header.kind, "message from unknown client");
                }
                MessageKind::Ping => {
                    self.reply(&peer, &header.sender, Payload::Pong {});
                }
                MessageKind::Disconnect => {
                    tracing::info!(client = %header.sender, "client left");
                    self.remove_client(&header.sender);
                }
                _ => self.route(&header, &inbound.frames),
            }
        }
    }

    /// Reset the heartbeat of a registered sender. Returns whether the sender
    /// is registered on this socket.
    fn touch(&self, sender: &str, peer: &PeerIdentity) -> bool {
        match self.inner.clients.borrow().get(sender) {
            Some(connection) if &connection.identity == peer => {
                connection.heartbeat.restart();
                true
            }
            _ => false,
        }
    }

    fn on_connect(&self, peer: PeerIdentity, frames: Vec<Frame>) {
        let message = match self.inner.registry.deserialize(&frames) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer = %peer, "dropping Connect: {}", e);
                return;
            }
        };
        let Payload::Connect {
            protocol_version,
            application_version,
            ..
        } = &message.payload
        else {
            return;
        };
        let sender = message.sender.clone();
        if sender.is_empty() || sender == SERVER_ID {
            tracing::warn!(peer = %peer, "Connect with reserved sender id {:?}", sender);
            return;
        }
        if protocol_version != PROTOCOL_VERSION || application_version != &self.inner.config.application_version {
            tracing::warn!(
                client = %sender,
                "rejecting client: protocol {} / application {}, expected {} / {}",
                protocol_version,
                application_version,
                PROTOCOL_VERSION,
                self.inner.config.application_version
            );
            let text = format!(
                "host runs version {}, this client runs {}",
                self.inner.config.application_version, application_version
            );
            self.reply(
                &peer,
                &sender,
                Payload::ConnectResponse {
                    result: ErrorCode::ConnectIncompatibleVersion,
                    response_text: text,
                },
            );
            if let Some(transport) = self.transport() {
                transport.drop_peer(&peer);
            }
            return;
        }

        let heartbeat = Timer::one_shot(self.inner.config.heartbeat_timeout());
        let weak = Rc::downgrade(&self.inner);
        let expired = sender.clone();
        heartbeat.start(move || {
            if let Some(server) = Server::from_weak(&weak) {
                server.on_heartbeat_expired(&expired);
            }
        });
        let joined = self.inner.joined.get() + 1;
        self.inner.joined.set(joined);
        let previous = self.inner.clients.borrow_mut().insert(
            sender.clone(),
            ClientConnection {
                identity: peer.clone(),
                heartbeat,
                connect_frames: frames.clone(),
                joined,
            },
        );
        if previous.is_some() {
            tracing::info!(client = %sender, "client reconnected");
        } else {
            tracing::info!(client = %sender, peer = %peer, "client connected");
        }

        self.reply(
            &peer,
            &sender,
            Payload::ConnectResponse {
                result: ErrorCode::None,
                response_text: String::new(),
            },
        );

        // Introduce the newcomer and the existing clients to each other.
        let others: Vec<(PeerIdentity, Vec<Frame>)> = {
            let clients = self.inner.clients.borrow();
            let mut others: Vec<_> = clients
                .iter()
                .filter(|(id, _)| **id != sender)
                .map(|(_, c)| (c.joined, c.identity.clone(), c.connect_frames.clone()))
                .collect();
            others.sort_by_key(|(joined, _, _)| *joined);
            others.into_iter().map(|(_, identity, frames)| (identity, frames)).collect()
        };
        if let Some(transport) = self.transport() {
            for (identity, connect_frames) in &others {
                transport.send(Some(identity), &frames);
                transport.send(Some(&peer), connect_frames);
            }
        }
        self.broadcast_peer_count();
    }

    fn on_heartbeat_expired(&self, client_id: &str) {
        let identity = match self.inner.clients.borrow().get(client_id) {
            Some(connection) => connection.identity.clone(),
            None => return,
        };
        tracing::warn!(client = %client_id, "client heartbeat timed out");
        if let Some(transport) = self.transport() {
            transport.drop_peer(&identity);
        }
        self.remove_client(client_id);
    }

    fn remove_client(&self, client_id: &str) {
        if self.inner.clients.borrow_mut().remove(client_id).is_none() {
            return;
        }
        self.broadcast(Payload::Disconnected {
            disconnected: client_id.to_string(),
        });
        self.broadcast_peer_count();
    }

    fn route(&self, header: &Header, frames: &[Frame]) {
        let Some(transport) = self.transport() else { return };
        let clients = self.inner.clients.borrow();
        match &header.target {
            Target::Broadcast => {
                for (id, connection) in clients.iter() {
                    if *id != header.sender {
                        transport.send(Some(&connection.identity), frames);
                    }
                }
                tracing::debug!(kind = %header.kind, sender = %header.sender, "broadcast");
            }
            Target::Client(id) if id == SERVER_ID => {
                tracing::debug!(kind = %header.kind, sender = %header.sender, "ignoring message addressed to the server");
            }
            Target::Client(id) => match clients.get(id) {
                Some(connection) => transport.send(Some(&connection.identity), frames),
                None => {
                    tracing::warn!(kind = %header.kind, client = %id, "dropping message for unknown client");
                }
            },
        }
    }

    /// Number of participants besides the host's loopback client.
    pub fn peer_count(&self) -> usize {
        let clients = self.inner.clients.borrow();
        let loopback = self.inner.loopback.borrow();
        match loopback.as_ref() {
            Some(id) if clients.contains_key(id) => clients.len() - 1,
            _ => clients.len(),
        }
    }

    fn broadcast_peer_count(&self) {
        let content = self.peer_count();
        tracing::debug!(peers = content, "peer count changed");
        self.broadcast(Payload::NumberOfPeers { content });
    }

    /// Send a server-originated message to every client.
    fn broadcast(&self, payload: Payload) {
        let Some(transport) = self.transport() else { return };
        let message = Message::new(SERVER_ID, Target::Broadcast, payload);
        let frames = match self.inner.registry.serialize(&message) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(kind = %message.kind(), "failed to serialize: {}", e);
                return;
            }
        };
        for connection in self.inner.clients.borrow().values() {
            transport.send(Some(&connection.identity), &frames);
        }
    }

    fn reply(&self, peer: &PeerIdentity, client_id: &str, payload: Payload) {
        let Some(transport) = self.transport() else { return };
        let message = Message::new(SERVER_ID, Target::client(client_id), payload);
        match self.inner.registry.serialize(&message) {
            Ok(frames) => transport.send(Some(peer), &frames),
            Err(e) => tracing::warn!(kind = %message.kind(), "failed to serialize: {}", e),
        }
    }

    fn transport(&self) -> Option<Transport> {
        self.inner.transport.borrow().clone()
    }

    /// Tell every client goodbye, forget them, and close the socket.
    pub fn shutdown(&self) {
        if self.inner.transport.borrow().is_none() {
            return;
        }
        self.broadcast(Payload::Disconnect {});
        self.inner.clients.borrow_mut().clear();
        self.inner.loopback.replace(None);
        if let Some(transport) = self.inner.transport.borrow_mut().take() {
            transport.close();
        }
        if self.inner.state.state() == ConnectionState::ServerRunning {
            if let Err(e) = self.inner.state.transition(ConnectionState::Disconnected) {
                tracing::warn!("{}", e);
            }
        }
        tracing::info!("server stopped");
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.clients.get_mut().clear();
        if let Some(transport) = self.transport.get_mut().take() {
            transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::dispatcher::MessageDispatcher;
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::LocalSet;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn running_server(config: SessionConfig) -> (Server, u16) {
        let server = Server::new(config, MessageRegistry::standard(), Rc::new(StateMachine::new()));
        server.start(0).await.unwrap();
        assert_eq!(server.state(), ConnectionState::ServerRunning);
        let port = server.local_addr().unwrap().port();
        (server, port)
    }

    struct Participant {
        client: Client,
        dispatcher: MessageDispatcher,
        inbox: Rc<RefCell<Vec<Message>>>,
    }

    async fn join(port: u16, config: SessionConfig, name: &str) -> Participant {
        let client = Client::new(config, MessageRegistry::standard(), Rc::new(StateMachine::new()));
        let dispatcher = MessageDispatcher::new(MessageRegistry::standard());
        dispatcher.set_sink(&client.sink());
        let inbox = Rc::new(RefCell::new(Vec::new()));
        let sink = inbox.clone();
        client.set_message_handler(move |batch| sink.borrow_mut().extend(batch));
        client.connect_to_host("127.0.0.1", port, json!({ "name": name })).unwrap();
        wait_until(|| client.state() == ConnectionState::ClientConnected).await;
        Participant {
            client,
            dispatcher,
            inbox,
        }
    }

    fn notifications(inbox: &Rc<RefCell<Vec<Message>>>) -> Vec<String> {
        inbox
            .borrow()
            .iter()
            .filter_map(|m| match &m.payload {
                Payload::Notification { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn mismatched_version_is_rejected() {
        LocalSet::new()
            .run_until(async {
                let (server, port) = running_server(SessionConfig::default()).await;
                let state = Rc::new(StateMachine::new());
                let config = SessionConfig {
                    application_version: "0.0.1-old".into(),
                    ..SessionConfig::default()
                };
                let client = Client::new(config, MessageRegistry::standard(), state.clone());
                client.connect_to_host("127.0.0.1", port, json!({})).unwrap();

                wait_until(|| state.error().is_some()).await;
                assert_eq!(
                    state.error().map(|e| e.code),
                    Some(ErrorCode::ConnectIncompatibleVersion)
                );
                assert_eq!(state.state(), ConnectionState::Disconnected);
                assert_eq!(server.client_count(), 0);
            })
            .await;
    }

    /// A bare socket that says `Connect` and then nothing else.
    async fn raw_peer(port: u16, id: &str, application_version: &str) -> (Transport, Rc<RefCell<Vec<Message>>>) {
        let transport = Transport::connect("127.0.0.1", port, TransportConfig::default())
            .await
            .unwrap();
        let inbox = Rc::new(RefCell::new(Vec::new()));
        let sink = inbox.clone();
        transport.start_reading(move |batch| {
            let registry = MessageRegistry::standard();
            for inbound in batch {
                sink.borrow_mut().push(registry.deserialize(&inbound.frames).unwrap());
            }
        });
        let connect = Message::new(
            id,
            Target::Broadcast,
            Payload::Connect {
                protocol_version: PROTOCOL_VERSION.to_string(),
                application_version: application_version.to_string(),
                client_data: json!({ "name": id }),
            },
        );
        transport.send(None, &MessageRegistry::standard().serialize(&connect).unwrap());
        (transport, inbox)
    }

    #[tokio::test]
    async fn rejected_client_is_hung_up_on() {
        LocalSet::new()
            .run_until(async {
                let (server, port) = running_server(SessionConfig::default()).await;
                let (peer, inbox) = raw_peer(port, "stale", "0.0.1-old").await;

                wait_until(|| !inbox.borrow().is_empty()).await;
                assert!(matches!(
                    inbox.borrow()[0].payload,
                    Payload::ConnectResponse {
                        result: ErrorCode::ConnectIncompatibleVersion,
                        ..
                    }
                ));
                assert_eq!(server.transport().unwrap().peer_count(), 0);
                // The peer never hangs up itself; the server closes the socket.
                wait_until(|| peer.peer_count() == 0).await;
                assert_eq!(server.client_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn routes_broadcast_and_directed_messages() {
        LocalSet::new()
            .run_until(async {
                let (server, port) = running_server(SessionConfig::default()).await;
                let alice = join(port, SessionConfig::default(), "Alice").await;
                let bob = join(port, SessionConfig::default(), "Bob").await;
                let carol = join(port, SessionConfig::default(), "Carol").await;
                assert_eq!(server.client_ids(), [alice.client.id(), bob.client.id(), carol.client.id()]);

                alice
                    .dispatcher
                    .send_message(Target::Broadcast, Payload::Notification { message: "all".into() });
                alice.dispatcher.send_message(
                    Target::client(bob.client.id()),
                    Payload::Notification { message: "bob only".into() },
                );
                alice.dispatcher.send_message(
                    Target::client("nobody"),
                    Payload::Notification { message: "lost".into() },
                );

                wait_until(|| notifications(&bob.inbox).len() == 2).await;
                wait_until(|| notifications(&carol.inbox).len() == 1).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(notifications(&bob.inbox), ["all", "bob only"]);
                assert_eq!(notifications(&carol.inbox), ["all"]);
                assert!(notifications(&alice.inbox).is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn newcomers_learn_about_everyone() {
        LocalSet::new()
            .run_until(async {
                let (server, port) = running_server(SessionConfig::default()).await;
                let host = join(port, SessionConfig::default(), "Alice").await;
                server.set_loopback(Some(host.client.id().to_string()));
                let guest = join(port, SessionConfig::default(), "Bob").await;

                let connects = |inbox: &Rc<RefCell<Vec<Message>>>| {
                    inbox
                        .borrow()
                        .iter()
                        .filter(|m| matches!(m.payload, Payload::Connect { .. }))
                        .map(|m| m.sender.clone())
                        .collect::<Vec<_>>()
                };
                wait_until(|| connects(&host.inbox).len() == 1 && connects(&guest.inbox).len() == 1).await;
                assert_eq!(connects(&host.inbox), [guest.client.id()]);
                assert_eq!(connects(&guest.inbox), [host.client.id()]);

                assert_eq!(server.peer_count(), 1);
                wait_until(|| guest.client.peer_count() == 1 && host.client.peer_count() == 1).await;
            })
            .await;
    }

    #[tokio::test]
    async fn departures_are_announced() {
        LocalSet::new()
            .run_until(async {
                let config = SessionConfig {
                    heartbeat_interval_ms: 50,
                    heartbeat_timeout_ms: 300,
                    ..SessionConfig::default()
                };
                let (server, port) = running_server(config.clone()).await;
                let stayer = join(port, config.clone(), "Alice").await;
                let leaver = join(port, config.clone(), "Bob").await;
                let leaver_id = leaver.client.id().to_string();
                wait_until(|| stayer.client.peer_count() == 2).await;

                leaver.client.disconnect_from_host();
                wait_until(|| server.client_count() == 1).await;
                wait_until(|| stayer.client.peer_count() == 1).await;
                let departed: Vec<_> = stayer
                    .inbox
                    .borrow()
                    .iter()
                    .filter_map(|m| match &m.payload {
                        Payload::Disconnected { disconnected } => Some(disconnected.clone()),
                        _ => None,
                    })
                    .collect();
                assert_eq!(departed, [leaver_id]);

                // Pings keep the remaining client alive past the timeout.
                tokio::time::sleep(Duration::from_millis(600)).await;
                assert_eq!(server.client_count(), 1);
                assert_eq!(stayer.client.state(), ConnectionState::ClientConnected);
            })
            .await;
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        LocalSet::new()
            .run_until(async {
                let config = SessionConfig {
                    heartbeat_interval_ms: 50,
                    heartbeat_timeout_ms: 300,
                    ..SessionConfig::default()
                };
                let (server, port) = running_server(config.clone()).await;
                let stayer = join(port, config.clone(), "Alice").await;
                let (silent, _) = raw_peer(port, "silent", &config.application_version).await;
                wait_until(|| server.client_count() == 2).await;
                wait_until(|| stayer.client.peer_count() == 2).await;

                wait_until(|| server.client_count() == 1).await;
                assert_eq!(server.client_ids(), [stayer.client.id()]);
                wait_until(|| stayer.client.peer_count() == 1).await;
                wait_until(|| silent.peer_count() == 0).await;

                tokio::time::sleep(Duration::from_millis(400)).await;
                let departed: Vec<_> = stayer
                    .inbox
                    .borrow()
                    .iter()
                    .filter_map(|m| match &m.payload {
                        Payload::Disconnected { disconnected } => Some(disconnected.clone()),
                        _ => None,
                    })
                    .collect();
                assert_eq!(departed, ["silent"]);
                assert_eq!(stayer.client.state(), ConnectionState::ClientConnected);
            })
            .await;
    }

    #[tokio::test]
    async fn shutdown_disconnects_guests() {
        LocalSet::new()
            .run_until(async {
                let (server, port) = running_server(SessionConfig::default()).await;
                let guest = join(port, SessionConfig::default(), "Bob").await;
                server.shutdown();
                assert_eq!(server.state(), ConnectionState::Disconnected);
                wait_until(|| guest.client.state() == ConnectionState::Disconnected).await;
                let error = guest.client.state_machine().error().unwrap();
                assert_eq!(error.code, ErrorCode::ConnectionLost);
                server.shutdown();
            })
            .await;
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_failure() {
        LocalSet::new()
            .run_until(async {
                let (_first, port) = running_server(SessionConfig::default()).await;
                let state = Rc::new(StateMachine::new());
                let second = Server::new(SessionConfig::default(), MessageRegistry::standard(), state.clone());
                second.start(port).await.unwrap();
                assert_eq!(state.state(), ConnectionState::Disconnected);
                assert_eq!(state.error().map(|e| e.code), Some(ErrorCode::BindFailure));
            })
            .await;
    }
}
