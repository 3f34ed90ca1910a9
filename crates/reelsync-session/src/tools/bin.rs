//! Bin (media library) items: add, remove, rename and move.

use super::{RemoteChange, Replicated, Update};
use crate::model::{Application, Change, EntityKind, EventKind, ModelEvent};
use reelsync_core::{MessageKind, Payload};

const BIN_KINDS: &[EntityKind] = &[EntityKind::Bin];
const ITEM_KINDS: &[EntityKind] = &[EntityKind::BinItem, EntityKind::Bin];

pub struct BinSync;

impl Replicated for BinSync {
    const NAME: &'static str = "bin";
    const EVENTS: &'static [EventKind] = &[
        EventKind::BinItemAdded,
        EventKind::BinItemRemoved,
        EventKind::BinItemRenamed,
        EventKind::BinItemMoved,
    ];
    const MESSAGES: &'static [MessageKind] = &[
        MessageKind::BinItemAdded,
        MessageKind::BinItemRemoved,
        MessageKind::BinItemRenamed,
        MessageKind::BinItemMoved,
    ];

    fn outbound(app: &dyn Application, event: &ModelEvent) -> Option<Payload> {
        match event {
            ModelEvent::BinItemAdded { bin, index, item } => {
                let added = app.find_item_by_guid(item, &[])?;
                match added.serialize() {
                    Ok(blob) => Some(Payload::BinItemAdded {
                        bin: bin.clone(),
                        index: *index,
                        item: blob,
                    }),
                    Err(e) => {
                        tracing::warn!(item = %item, "failed to serialize bin item: {}", e);
                        None
                    }
                }
            }
            ModelEvent::BinItemRemoved { item } => Some(Payload::BinItemRemoved { item: item.clone() }),
            ModelEvent::BinItemRenamed { item, name } => Some(Payload::BinItemRenamed {
                item: item.clone(),
                name: name.clone(),
            }),
            ModelEvent::BinItemMoved { item, bin, index } => Some(Payload::BinItemMoved {
                item: item.clone(),
                bin: bin.clone(),
                index: *index,
            }),
            _ => None,
        }
    }

    fn inbound(payload: &Payload) -> Option<RemoteChange> {
        let (entity, kinds, change) = match payload {
            Payload::BinItemAdded { bin, index, item } => (
                bin,
                BIN_KINDS,
                Change::InsertChild {
                    index: *index,
                    blob: item.clone(),
                },
            ),
            Payload::BinItemRemoved { item } => (item, ITEM_KINDS, Change::Remove),
            Payload::BinItemRenamed { item, name } => (
                item,
                ITEM_KINDS,
                Change::Rename(name.clone()),
            ),
            Payload::BinItemMoved { item, bin, index } => (
                item,
                ITEM_KINDS,
                Change::MoveTo {
                    parent: bin.clone(),
                    index: *index,
                },
            ),
            _ => return None,
        };
        Some(RemoteChange {
            entity: entity.clone(),
            kinds,
            update: Update::Apply(change),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::EntitySyncTool;
    use super::super::testing::Harness;
    use super::*;
    use crate::memory::Node;

    #[test]
    fn added_item_carries_its_serialized_form() {
        let harness = Harness::new();
        let bin = Node::new(EntityKind::Bin, "footage");
        let bin_guid = bin.guid.clone();
        harness
            .app
            .create_project_from(Node::new(EntityKind::Project, "reel").child(bin));
        let _tool = EntitySyncTool::<BinSync>::register(&harness.ctx);

        let item = Node::new(EntityKind::BinItem, "take 1");
        let entity = harness.app.find_item_by_guid(&bin_guid, &[]).unwrap();
        entity
            .apply(Change::InsertChild {
                index: 0,
                blob: serde_json::to_vec(&item).unwrap(),
            })
            .unwrap();

        assert_eq!(
            harness.sent(),
            [Payload::BinItemAdded {
                bin: bin_guid,
                index: 0,
                item: serde_json::to_vec(&item).unwrap(),
            }]
        );
    }

    #[test]
    fn remote_rename_and_remove_apply_silently() {
        let harness = Harness::new();
        let item = Node::new(EntityKind::BinItem, "take 1");
        let item_guid = item.guid.clone();
        let project = harness.app.create_project_from(
            Node::new(EntityKind::Project, "reel").child(Node::new(EntityKind::Bin, "footage").child(item)),
        );
        let _tool = EntitySyncTool::<BinSync>::register(&harness.ctx);

        harness.receive(Payload::BinItemRenamed {
            item: item_guid.clone(),
            name: "hero take".into(),
        });
        assert_eq!(project.find(&item_guid).unwrap().name, "hero take");

        harness.receive(Payload::BinItemRemoved { item: item_guid.clone() });
        assert!(project.find(&item_guid).is_none());
        assert!(harness.sent().is_empty());
    }
}
