//! One collaborative session, as seen by one participant.
//!
//! A host session owns the server plus a client looped back to it; a guest
//! session owns a single client. Both own a dispatcher and the sync tools for
//! their role, created in a fixed order and unregistered in reverse.

use crate::client::Client;
use crate::config::SessionConfig;
use crate::dispatcher::MessageDispatcher;
use crate::error::SessionError;
use crate::model::Application;
use crate::server::Server;
use crate::tools::{
    ActiveVersionSync, BinSync, EffectParameterSync, EnabledSync, EntitySyncTool, HostProjectTool, Participant,
    PeerRosterTool, ProjectPushTool, RangeSync, StructureSync, SyncTool, ToolContext,
};
use reelsync_core::{MessageRegistry, RemoteGuard};
use serde_json::Value;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

pub struct Session {
    role: Role,
    server: Option<Server>,
    client: Client,
    dispatcher: MessageDispatcher,
    loading: RemoteGuard,
    roster: Rc<PeerRosterTool>,
    project_push: Rc<ProjectPushTool>,
    host_projects: Option<Rc<HostProjectTool>>,
    /// Every tool in creation order.
    tools: Vec<Rc<dyn SyncTool>>,
}

impl Session {
    /// Wire `client` to a fresh dispatcher and register the tools for `role`.
    /// Nothing is sent until the client connects.
    pub fn new(
        role: Role,
        config: &SessionConfig,
        registry: MessageRegistry,
        app: Rc<dyn Application>,
        client: Client,
        server: Option<Server>,
        client_data: &Value,
    ) -> Rc<Self> {
        let dispatcher = MessageDispatcher::new(registry);
        dispatcher.set_sink(&client.sink());
        let weak = dispatcher.downgrade();
        client.set_message_handler(move |batch| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.on_messages_received(batch);
            }
        });

        let loading = RemoteGuard::new();
        let ctx = ToolContext {
            dispatcher: dispatcher.clone(),
            app,
            loading: loading.clone(),
        };

        let roster = PeerRosterTool::register(&ctx);
        let project_push = ProjectPushTool::register(&ctx, config.temp_dir.join(client.id()));
        let mut tools: Vec<Rc<dyn SyncTool>> = vec![
            roster.clone(),
            project_push.clone(),
            EntitySyncTool::<ActiveVersionSync>::register(&ctx),
            EntitySyncTool::<EnabledSync>::register(&ctx),
            EntitySyncTool::<RangeSync>::register(&ctx),
            EntitySyncTool::<EffectParameterSync>::register(&ctx),
            EntitySyncTool::<StructureSync>::register(&ctx),
            EntitySyncTool::<BinSync>::register(&ctx),
        ];
        let host_projects = match role {
            Role::Host => {
                let tool = HostProjectTool::register(&ctx, project_push.clone(), client.id());
                tools.push(tool.clone());
                Some(tool)
            }
            Role::Guest => None,
        };

        roster.add(Participant::from_client_data(client.id(), client_data.clone()));
        tracing::debug!(role = ?role, tools = tools.len(), "session created");

        Rc::new(Self {
            role,
            server,
            client,
            dispatcher,
            loading,
            roster,
            project_push,
            host_projects,
            tools,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// Held while a project push is being received.
    pub fn loading(&self) -> &RemoteGuard {
        &self.loading
    }

    pub fn roster(&self) -> &Rc<PeerRosterTool> {
        &self.roster
    }

    pub fn project_push(&self) -> &Rc<ProjectPushTool> {
        &self.project_push
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    /// Resend every tracked project to every guest.
    pub fn push_session(&self) -> Result<usize, SessionError> {
        let host_projects = self.host_projects.as_ref().ok_or(SessionError::NotHost)?;
        Ok(host_projects.push_session())
    }

    /// Unregister the tools, then close the connection. Idempotent.
    pub fn teardown(&self) {
        for tool in self.tools.iter().rev() {
            tool.unregister();
        }
        self.client.disconnect_from_host();
        if let Some(server) = &self.server {
            server.shutdown();
        }
        self.dispatcher.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryApplication;
    use crate::model::Application as _;
    use reelsync_core::StateMachine;
    use serde_json::json;

    fn session(role: Role, app: Rc<MemoryApplication>) -> Rc<Session> {
        let config = SessionConfig::default();
        let registry = MessageRegistry::standard();
        let client = Client::new(config.clone(), registry.clone(), Rc::new(StateMachine::new()));
        let server = (role == Role::Host)
            .then(|| Server::new(config.clone(), registry.clone(), Rc::new(StateMachine::new())));
        Session::new(role, &config, registry, app, client, server, &json!({"name": "Alice"}))
    }

    #[test]
    fn host_runs_every_tool_plus_auto_push() {
        let host = session(Role::Host, MemoryApplication::new());
        assert_eq!(
            host.tool_names(),
            [
                "roster",
                "project-push",
                "active-version",
                "enabled",
                "range",
                "effect-parameter",
                "structure",
                "bin",
                "host-projects",
            ]
        );
        let guest = session(Role::Guest, MemoryApplication::new());
        assert_eq!(guest.tool_names().len(), 8);
        assert!(matches!(guest.push_session(), Err(SessionError::NotHost)));
    }

    #[test]
    fn local_participant_is_on_the_roster() {
        let guest = session(Role::Guest, MemoryApplication::new());
        let me = guest.roster().participant(guest.client().id()).unwrap();
        assert_eq!(me.name, "Alice");
    }

    #[test]
    fn teardown_releases_every_subscription() {
        let app = MemoryApplication::new();
        let host = session(Role::Host, app.clone());
        assert!(app.events().subscriber_count() > 0);
        assert!(host.dispatcher().handler_count() > 0);

        host.teardown();
        host.teardown();
        assert_eq!(app.events().subscriber_count(), 0);
        assert_eq!(host.dispatcher().handler_count(), 0);
    }
}
