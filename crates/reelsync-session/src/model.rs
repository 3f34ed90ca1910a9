//! The editorial model, as seen by the sync layer.
//!
//! The sync layer never looks inside projects. It finds entities by guid,
//! serializes and deserializes them, mutates them through [`Entity::apply`],
//! and listens to the local events the model raises. An application embeds
//! reelsync by implementing these traits; [`crate::memory`] provides an
//! in-memory implementation.

use reelsync_core::{Guid, ObserverId, Subject};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Bin,
    BinItem,
    Sequence,
    Track,
    Clip,
    Effect,
    VersionStack,
}

/// A mutation requested through the model's normal API.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    SetActiveVersion(String),
    SetEnabled(bool),
    SetRange { start: i64, end: i64 },
    SetParameter { name: String, value: Value },
    Rename(String),
    /// Insert a serialized child at `index`.
    InsertChild { index: usize, blob: Vec<u8> },
    /// Remove the entity from its parent.
    Remove,
    MoveTo { parent: Guid, index: usize },
}

/// Local notifications raised by the model after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    ProjectOpened { project: Guid },
    ProjectCreated { project: Guid },
    ProjectClosed { project: Guid },
    ActiveVersionChanged { entity: Guid, version: String },
    EnabledChanged { entity: Guid, enabled: bool },
    RangeChanged { entity: Guid, start: i64, end: i64 },
    ParameterChanged { effect: Guid, name: String, value: Value },
    StructureEdited { entity: Guid },
    BinItemAdded { bin: Guid, index: usize, item: Guid },
    BinItemRemoved { item: Guid },
    BinItemRenamed { item: Guid, name: String },
    BinItemMoved { item: Guid, bin: Guid, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProjectOpened,
    ProjectCreated,
    ProjectClosed,
    ActiveVersionChanged,
    EnabledChanged,
    RangeChanged,
    ParameterChanged,
    StructureEdited,
    BinItemAdded,
    BinItemRemoved,
    BinItemRenamed,
    BinItemMoved,
}

impl ModelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ModelEvent::ProjectOpened { .. } => EventKind::ProjectOpened,
            ModelEvent::ProjectCreated { .. } => EventKind::ProjectCreated,
            ModelEvent::ProjectClosed { .. } => EventKind::ProjectClosed,
            ModelEvent::ActiveVersionChanged { .. } => EventKind::ActiveVersionChanged,
            ModelEvent::EnabledChanged { .. } => EventKind::EnabledChanged,
            ModelEvent::RangeChanged { .. } => EventKind::RangeChanged,
            ModelEvent::ParameterChanged { .. } => EventKind::ParameterChanged,
            ModelEvent::StructureEdited { .. } => EventKind::StructureEdited,
            ModelEvent::BinItemAdded { .. } => EventKind::BinItemAdded,
            ModelEvent::BinItemRemoved { .. } => EventKind::BinItemRemoved,
            ModelEvent::BinItemRenamed { .. } => EventKind::BinItemRenamed,
            ModelEvent::BinItemMoved { .. } => EventKind::BinItemMoved,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("entity not found: {0}")]
    NotFound(Guid),
    #[error("{kind:?} does not support {operation}")]
    Unsupported {
        kind: EntityKind,
        operation: &'static str,
    },
    #[error("index {index} out of range for {parent}")]
    InvalidIndex { parent: Guid, index: usize },
    #[error("serialized entity has guid {found}, expected {expected}")]
    GuidMismatch { expected: Guid, found: Guid },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// An addressable unit of the editorial model.
pub trait Entity {
    fn guid(&self) -> Guid;

    fn kind(&self) -> EntityKind;

    fn serialize(&self) -> Result<Vec<u8>, ModelError>;

    /// Replace this entity's contents; raises `StructureEdited`.
    fn deserialize(&self, blob: &[u8]) -> Result<(), ModelError>;

    /// Mutate through the normal API; raises the matching local event.
    fn apply(&self, change: Change) -> Result<(), ModelError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveFlags {
    /// Write a copy without re-pointing the project at `path`.
    pub as_copy: bool,
}

pub trait Project {
    fn guid(&self) -> Guid;

    fn name(&self) -> String;

    fn path(&self) -> Option<PathBuf>;

    fn set_path(&self, path: Option<PathBuf>);

    fn save_as(&self, path: &Path, flags: SaveFlags) -> Result<(), ModelError>;

    fn stop_playback(&self);

    /// State the saved file does not capture (open sequence, playhead, ...).
    fn viewer_state(&self) -> Value;

    fn set_viewer_state(&self, state: Value) -> Result<(), ModelError>;
}

pub trait Application {
    fn events(&self) -> &EventBus;

    /// Look an entity up by guid; an empty `kinds` matches any kind.
    fn find_item_by_guid(&self, guid: &Guid, kinds: &[EntityKind]) -> Option<Rc<dyn Entity>>;

    fn projects(&self) -> Vec<Rc<dyn Project>>;

    fn project(&self, guid: &Guid) -> Option<Rc<dyn Project>> {
        self.projects().into_iter().find(|p| &p.guid() == guid)
    }

    /// Open a project file; raises `ProjectOpened`.
    fn open_project(&self, path: &Path) -> Result<Rc<dyn Project>, ModelError>;

    /// Close an open project; raises `ProjectClosed`.
    fn close_project(&self, guid: &Guid) -> Result<(), ModelError>;
}

/// Model event subscriptions, filtered by event kind.
#[derive(Debug, Default)]
pub struct EventBus {
    subject: Subject<ModelEvent>,
}

pub type SubscriptionId = ObserverId;

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, callback: impl Fn(&ModelEvent) + 'static) -> SubscriptionId {
        self.subject.subscribe(move |event| {
            if event.kind() == kind {
                callback(event);
            }
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subject.unsubscribe(id)
    }

    pub fn emit(&self, event: &ModelEvent) {
        self.subject.notify(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subject.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn subscribers_only_see_their_kind() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.subscribe(EventKind::EnabledChanged, move |e| sink.borrow_mut().push(e.clone()));

        bus.emit(&ModelEvent::BinItemRemoved { item: Guid::from("i") });
        let toggled = ModelEvent::EnabledChanged {
            entity: Guid::from("c"),
            enabled: false,
        };
        bus.emit(&toggled);
        assert_eq!(*seen.borrow(), vec![toggled.clone()]);

        assert!(bus.unsubscribe(id));
        bus.emit(&toggled);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
