//! Host-side project sharing.
//!
//! The host pushes every tracked project to each participant that joins,
//! shares projects it opens or creates during the session, and announces
//! the ones it closes.

use super::{ProjectPushTool, SyncTool, ToolContext, ToolRegistration};
use crate::model::{EventKind, ModelEvent};
use reelsync_core::{MessageKind, RemoteGuard, Target};
use std::rc::Rc;

pub struct HostProjectTool {
    ctx: ToolContext,
    push: Rc<ProjectPushTool>,
    /// The host's own client id; its `Connect` is not a newcomer.
    local_id: String,
    guard: RemoteGuard,
    registration: ToolRegistration,
}

impl HostProjectTool {
    pub fn register(ctx: &ToolContext, push: Rc<ProjectPushTool>, local_id: impl Into<String>) -> Rc<Self> {
        let tool = Rc::new(Self {
            ctx: ctx.clone(),
            push,
            local_id: local_id.into(),
            guard: ctx.loading.child(),
            registration: ToolRegistration::new(ctx),
        });

        let weak = Rc::downgrade(&tool);
        tool.registration.on_message(MessageKind::Connect, move |message| {
            if let Some(tool) = weak.upgrade() {
                tool.on_peer_joined(&message.sender);
            }
            Ok(())
        });

        for kind in [EventKind::ProjectOpened, EventKind::ProjectCreated, EventKind::ProjectClosed] {
            let weak = Rc::downgrade(&tool);
            tool.registration.on_event(kind, move |event| {
                if let Some(tool) = weak.upgrade() {
                    tool.guard.run_local(|| tool.on_local_event(event));
                }
            });
        }
        tool
    }

    /// Push every tracked project to everyone.
    pub fn push_session(&self) -> usize {
        let tracked = self.push.tracked();
        self.push.push_projects(Target::Broadcast, &tracked)
    }

    fn on_peer_joined(&self, client_id: &str) {
        if client_id == self.local_id {
            return;
        }
        let tracked = self.push.tracked();
        tracing::info!(client = %client_id, count = tracked.len(), "sending session projects to newcomer");
        self.push.push_projects(Target::client(client_id), &tracked);
    }

    fn on_local_event(&self, event: &ModelEvent) {
        match event {
            ModelEvent::ProjectOpened { project } | ModelEvent::ProjectCreated { project } => {
                let Some(opened) = self.ctx.app.project(project) else {
                    return;
                };
                self.push.track(opened);
                self.push.push_projects(Target::Broadcast, std::slice::from_ref(project));
            }
            ModelEvent::ProjectClosed { project } => {
                if self.push.forget(project).is_some() {
                    tracing::info!(project = %project, "project left the session");
                    self.push.send_close(project);
                }
            }
            _ => {}
        }
    }
}

impl SyncTool for HostProjectTool {
    fn name(&self) -> &'static str {
        "host-projects"
    }

    fn unregister(&self) {
        self.registration.release();
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use crate::model::{Application, Project};
    use reelsync_core::{Message, Payload};
    use serde_json::json;

    fn setup(harness: &Harness, dir: &std::path::Path) -> (Rc<ProjectPushTool>, Rc<HostProjectTool>) {
        let push = ProjectPushTool::register(&harness.ctx, dir.to_path_buf());
        let host = HostProjectTool::register(&harness.ctx, push.clone(), "host-1");
        (push, host)
    }

    fn connect(sender: &str) -> Message {
        Message::new(
            sender,
            Target::Broadcast,
            Payload::Connect {
                protocol_version: "1".into(),
                application_version: "0.1.0".into(),
                client_data: json!({}),
            },
        )
    }

    #[test]
    fn newcomer_receives_tracked_projects() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new();
        let project = harness.app.create_project("reel");
        let (push, _host) = setup(&harness, dir.path());
        push.track(project.clone());

        harness.ctx.dispatcher.on_message_received(connect("host-1"));
        assert!(harness.sent().is_empty());

        harness.ctx.dispatcher.on_message_received(connect("c-2"));
        let sent = harness.outbox.sent.borrow();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|m| m.target == Target::client("c-2")));
    }

    #[test]
    fn opened_projects_are_shared_and_closed_ones_announced() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new();
        let (push, _host) = setup(&harness, dir.path());

        let project = harness.app.create_project("late addition");
        assert!(push.is_tracked(&project.guid()));
        let kinds: Vec<_> = harness.sent().iter().map(|p| p.kind()).collect();
        assert_eq!(
            kinds,
            [
                MessageKind::ProjectPushBegin,
                MessageKind::ProjectPush,
                MessageKind::ProjectViewerState,
                MessageKind::ProjectPushEnd,
            ]
        );

        harness.app.close_project(&project.guid()).unwrap();
        assert!(!push.is_tracked(&project.guid()));
        assert_eq!(
            harness.sent().last(),
            Some(&Payload::ProjectClose { guid: project.guid() })
        );
    }

    #[test]
    fn projects_opened_while_loading_stay_private() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new();
        let (push, _host) = setup(&harness, dir.path());

        let _loading = harness.ctx.loading.enter();
        let project = harness.app.create_project("received");
        assert!(!push.is_tracked(&project.guid()));
        assert!(harness.sent().is_empty());
    }
}
