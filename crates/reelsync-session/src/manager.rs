//! Process-wide entry point: at most one session at a time.
//!
//! Each lifecycle operation checks the connection state first and fails with
//! [`SessionError::InvalidState`] instead of guessing. Failures that happen
//! later (lost host, refused connection, heartbeat loss) surface through the
//! state observers; the manager then retires the session it belonged to.

use crate::client::Client;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::model::Application;
use crate::server::Server;
use crate::session::{Role, Session};
use crate::tools::{Participant, ProjectPushTool};
use reelsync_core::{
    ConnectionError, ConnectionState, Guid, MessageRegistry, ObserverId, StateChange, StateMachine,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::net::Ipv4Addr;
use std::rc::Rc;

struct ManagerInner {
    config: SessionConfig,
    registry: MessageRegistry,
    app: Rc<dyn Application>,
    state: Rc<StateMachine>,
    session: RefCell<Option<Rc<Session>>>,
    /// Set while `start_server` awaits the bind.
    starting: Cell<bool>,
}

impl ManagerInner {
    fn take_session(&self) -> Option<Rc<Session>> {
        self.session.borrow_mut().take()
    }

    /// Tear `session` down, and forget it if it is still the current one.
    fn retire(&self, session: &Rc<Session>) {
        let current = {
            let mut slot = self.session.borrow_mut();
            match slot.as_ref() {
                Some(existing) if Rc::ptr_eq(existing, session) => slot.take(),
                _ => None,
            }
        };
        if current.is_some() {
            tracing::info!(role = ?session.role(), "session ended");
        }
        session.teardown();
    }
}

/// Must be used from within a `tokio::task::LocalSet`.
pub struct ConnectionManager {
    inner: Rc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        config: SessionConfig,
        registry: MessageRegistry,
        app: Rc<dyn Application>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let inner = Rc::new(ManagerInner {
            config,
            registry,
            app,
            state: Rc::new(StateMachine::new()),
            session: RefCell::new(None),
            starting: Cell::new(false),
        });

        let weak = Rc::downgrade(&inner);
        inner.state.subscribe(move |change| {
            if change.new != ConnectionState::Disconnected {
                return;
            }
            let Some(inner) = weak.upgrade() else { return };
            let Some(stale) = inner.session.borrow().clone() else { return };
            // Observers run inside client and server callbacks; retire later.
            let weak = Rc::downgrade(&inner);
            tokio::task::spawn_local(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.retire(&stale);
                }
            });
        });
        Ok(Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    pub fn error(&self) -> Option<ConnectionError> {
        self.inner.state.error()
    }

    pub fn subscribe_state(&self, observer: impl Fn(&StateChange) + 'static) -> ObserverId {
        self.inner.state.subscribe(observer)
    }

    pub fn unsubscribe_state(&self, id: ObserverId) -> bool {
        self.inner.state.unsubscribe(id)
    }

    fn require(&self, expected: &'static str, allowed: &[ConnectionState]) -> Result<(), SessionError> {
        let actual = self.state();
        if self.inner.starting.get() || !allowed.contains(&actual) {
            return Err(SessionError::InvalidState { expected, actual });
        }
        Ok(())
    }

    /// Host a session on `port` (0 picks a free one) and share `projects`.
    ///
    /// A bind failure is reported through the state observers and leaves
    /// the manager disconnected.
    pub async fn start_server(&self, port: u16, client_data: Value, projects: &[Guid]) -> Result<(), SessionError> {
        self.require("Disconnected", &[ConnectionState::Disconnected])?;
        self.inner.starting.set(true);
        let result = self.start_host(port, client_data, projects).await;
        self.inner.starting.set(false);
        result
    }

    async fn start_host(&self, port: u16, client_data: Value, projects: &[Guid]) -> Result<(), SessionError> {
        let inner = &self.inner;
        if let Some(stale) = inner.take_session() {
            stale.teardown();
        }

        let server = Server::new(inner.config.clone(), inner.registry.clone(), inner.state.clone());
        server.start(port).await?;
        if server.state() != ConnectionState::ServerRunning {
            return Ok(());
        }
        let port = server.local_addr().map_or(port, |addr| addr.port());

        // The loopback client has its own state; the manager reports the server's.
        let loopback_state = Rc::new(StateMachine::new());
        let client = Client::new(inner.config.clone(), inner.registry.clone(), loopback_state.clone());
        server.set_loopback(Some(client.id().to_string()));
        let session = Session::new(
            Role::Host,
            &inner.config,
            inner.registry.clone(),
            inner.app.clone(),
            client.clone(),
            Some(server),
            &client_data,
        );
        for guid in projects {
            match inner.app.project(guid) {
                Some(project) => session.project_push().track(project),
                None => tracing::warn!(project = %guid, "cannot share a project that is not open"),
            }
        }

        let main_state = Rc::downgrade(&inner.state);
        loopback_state.subscribe(move |change| {
            let (Some(state), Some(error)) = (main_state.upgrade(), &change.error) else {
                return;
            };
            tracing::warn!(code = ?error.code, "host loopback failed: {}", error.text);
            state.fail(error.code, error.text.clone());
        });

        inner.session.replace(Some(session));
        tracing::info!(port, "hosting session");
        client.connect_to_host(&Ipv4Addr::LOCALHOST.to_string(), port, client_data)?;
        Ok(())
    }

    pub fn stop_server(&self) -> Result<(), SessionError> {
        self.require("ServerRunning", &[ConnectionState::ServerRunning])?;
        if let Some(session) = self.inner.take_session() {
            session.teardown();
        }
        Ok(())
    }

    /// Join the session hosted at `host:port`.
    pub fn connect_client(&self, host: &str, port: u16, client_data: Value) -> Result<(), SessionError> {
        self.require("Disconnected", &[ConnectionState::Disconnected])?;
        let inner = &self.inner;
        if let Some(stale) = inner.take_session() {
            stale.teardown();
        }
        let client = Client::new(inner.config.clone(), inner.registry.clone(), inner.state.clone());
        let session = Session::new(
            Role::Guest,
            &inner.config,
            inner.registry.clone(),
            inner.app.clone(),
            client.clone(),
            None,
            &client_data,
        );
        inner.session.replace(Some(session));
        client.connect_to_host(host, port, client_data)?;
        Ok(())
    }

    pub fn disconnect_client(&self) -> Result<(), SessionError> {
        self.require(
            "ClientConnecting or ClientConnected",
            &[ConnectionState::ClientConnecting, ConnectionState::ClientConnected],
        )?;
        if let Some(session) = self.inner.take_session() {
            session.teardown();
        }
        Ok(())
    }

    /// Resend every shared project to every guest.
    pub fn push_session(&self) -> Result<usize, SessionError> {
        self.require("ServerRunning", &[ConnectionState::ServerRunning])?;
        let session = self.session().ok_or(SessionError::NotHost)?;
        session.push_session()
    }

    pub fn session(&self) -> Option<Rc<Session>> {
        self.inner.session.borrow().clone()
    }

    pub fn client_id(&self) -> Option<String> {
        self.session().map(|session| session.client().id().to_string())
    }

    /// The port actually bound while hosting.
    pub fn local_port(&self) -> Option<u16> {
        let session = self.session()?;
        session.server()?.local_addr().map(|addr| addr.port())
    }

    /// Ids of every client admitted by the server, the host's own included.
    pub fn connected_clients(&self) -> Vec<String> {
        self.session()
            .and_then(|session| session.server().map(Server::client_ids))
            .unwrap_or_default()
    }

    /// Participants besides the host, as last announced by the server.
    pub fn peer_count(&self) -> usize {
        self.session().map_or(0, |session| session.client().peer_count())
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.session()
            .map(|session| session.roster().participants())
            .unwrap_or_default()
    }

    pub fn project_push(&self) -> Option<Rc<ProjectPushTool>> {
        self.session().map(|session| session.project_push().clone())
    }

    /// Show `message` to every other participant.
    pub fn notify_all(&self, message: &str) {
        if let Some(session) = self.session() {
            session.roster().notify_all(message);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.inner.take_session() {
            session.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryApplication;
    use serde_json::json;

    fn manager() -> ConnectionManager {
        let config = SessionConfig {
            temp_dir: std::env::temp_dir().join("reelsync-manager-tests"),
            ..SessionConfig::default()
        };
        ConnectionManager::new(config, MessageRegistry::standard(), MemoryApplication::new()).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SessionConfig {
            heartbeat_timeout_ms: 10,
            heartbeat_interval_ms: 100,
            ..SessionConfig::default()
        };
        let result = ConnectionManager::new(config, MessageRegistry::standard(), MemoryApplication::new());
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[test]
    fn operations_check_their_preconditions() {
        let manager = manager();
        assert!(matches!(
            manager.stop_server(),
            Err(SessionError::InvalidState { actual: ConnectionState::Disconnected, .. })
        ));
        assert!(matches!(manager.disconnect_client(), Err(SessionError::InvalidState { .. })));
        assert!(matches!(manager.push_session(), Err(SessionError::InvalidState { .. })));
        assert!(manager.session().is_none());
    }

    #[tokio::test]
    async fn stop_server_returns_to_disconnected() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let manager = manager();
                manager.start_server(0, json!({"name": "Alice"}), &[]).await.unwrap();
                assert_eq!(manager.state(), ConnectionState::ServerRunning);
                assert!(manager.local_port().is_some());
                assert!(matches!(
                    manager.connect_client("localhost", 1, json!({})),
                    Err(SessionError::InvalidState { actual: ConnectionState::ServerRunning, .. })
                ));

                manager.stop_server().unwrap();
                assert_eq!(manager.state(), ConnectionState::Disconnected);
                assert_eq!(manager.error(), None);
                assert!(manager.session().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn refused_connection_retires_the_session() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let port = {
                    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                    listener.local_addr().unwrap().port()
                };
                let manager = manager();
                manager.connect_client("127.0.0.1", port, json!({"name": "Bob"})).unwrap();
                assert_eq!(manager.state(), ConnectionState::ClientConnecting);

                for _ in 0..200 {
                    if manager.session().is_none() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                assert_eq!(manager.state(), ConnectionState::Disconnected);
                assert_eq!(manager.error().map(|e| e.code), Some(reelsync_core::ErrorCode::ConnectRefused));
                assert!(manager.session().is_none());
            })
            .await;
    }
}
