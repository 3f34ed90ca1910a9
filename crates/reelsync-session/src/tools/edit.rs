//! Editorial structure edits.
//!
//! There is no fine-grained diffing: an edit to a sequence or track ships
//! the whole serialized entity, and the receiver replaces its copy.

use super::{RemoteChange, Replicated, Update};
use crate::model::{Application, EntityKind, EventKind, ModelEvent};
use reelsync_core::{MessageKind, Payload, RemoveDuplicateMessagesFilter};

const STRUCTURE_KINDS: &[EntityKind] = &[EntityKind::Sequence, EntityKind::Track];

pub struct StructureSync;

impl Replicated for StructureSync {
    const NAME: &'static str = "structure";
    const EVENTS: &'static [EventKind] = &[EventKind::StructureEdited];
    const MESSAGES: &'static [MessageKind] = &[MessageKind::ApplyEdit];

    fn outbound(app: &dyn Application, event: &ModelEvent) -> Option<Payload> {
        let ModelEvent::StructureEdited { entity } = event else {
            return None;
        };
        let item = app.find_item_by_guid(entity, STRUCTURE_KINDS)?;
        match item.serialize() {
            Ok(content) => Some(Payload::ApplyEdit {
                entity: entity.clone(),
                content,
            }),
            Err(e) => {
                tracing::warn!(entity = %entity, "failed to serialize edited entity: {}", e);
                None
            }
        }
    }

    fn inbound(payload: &Payload) -> Option<RemoteChange> {
        match payload {
            Payload::ApplyEdit { entity, content } => Some(RemoteChange {
                entity: entity.clone(),
                kinds: STRUCTURE_KINDS,
                update: Update::Replace(content.clone()),
            }),
            _ => None,
        }
    }

    /// A later full copy supersedes an earlier one.
    fn filters() -> Vec<RemoveDuplicateMessagesFilter> {
        vec![RemoveDuplicateMessagesFilter::matching(MessageKind::ApplyEdit, &["entity"])]
    }
}

#[cfg(test)]
mod tests {
    use super::super::EntitySyncTool;
    use super::super::testing::Harness;
    use super::*;
    use crate::memory::Node;
    use crate::model::Change;

    #[test]
    fn edit_ships_the_whole_sequence() {
        let harness = Harness::new();
        let sequence = Node::new(EntityKind::Sequence, "main").child(Node::new(EntityKind::Clip, "a"));
        let guid = sequence.guid.clone();
        harness
            .app
            .create_project_from(Node::new(EntityKind::Project, "reel").child(sequence));
        let _tool = EntitySyncTool::<StructureSync>::register(&harness.ctx);

        let clip = serde_json::to_vec(&Node::new(EntityKind::Clip, "b")).unwrap();
        let entity = harness.app.find_item_by_guid(&guid, &[]).unwrap();
        entity.apply(Change::InsertChild { index: 1, blob: clip }).unwrap();

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        let Payload::ApplyEdit { entity: edited, content } = &sent[0] else {
            panic!("unexpected {:?}", sent[0]);
        };
        assert_eq!(edited, &guid);
        let shipped: Node = serde_json::from_slice(content).unwrap();
        assert_eq!(shipped.children.len(), 2);
    }

    #[test]
    fn received_edit_replaces_local_copy() {
        let harness = Harness::new();
        let sequence = Node::new(EntityKind::Sequence, "main");
        let guid = sequence.guid.clone();
        let project = harness
            .app
            .create_project_from(Node::new(EntityKind::Project, "reel").child(sequence.clone()));
        let _tool = EntitySyncTool::<StructureSync>::register(&harness.ctx);

        let edited = sequence.child(Node::new(EntityKind::Clip, "new"));
        harness.receive(Payload::ApplyEdit {
            entity: guid.clone(),
            content: serde_json::to_vec(&edited).unwrap(),
        });
        assert_eq!(project.find(&guid).unwrap(), edited);
        assert!(harness.sent().is_empty());
    }
}
