//! In-memory editorial model.
//!
//! Projects are trees of [`Node`]s stored as JSON. Every mutation goes through
//! [`Entity::apply`] and raises the same event a user edit would, which makes
//! this model a faithful stand-in for a real application in tests and demos.

use crate::model::{
    Application, Change, Entity, EntityKind, EventBus, ModelError, ModelEvent, Project, SaveFlags,
};
use reelsync_core::Guid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub guid: Guid,
    pub kind: EntityKind,
    pub name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::with_guid(Guid::new(uuid::Uuid::new_v4().to_string()), kind, name)
    }

    pub fn with_guid(guid: Guid, kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            guid,
            kind,
            name: name.into(),
            properties: Map::new(),
            children: Vec::new(),
        }
    }

    pub fn child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn find(&self, guid: &Guid) -> Option<&Node> {
        if &self.guid == guid {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(guid))
    }

    fn find_mut(&mut self, guid: &Guid) -> Option<&mut Node> {
        if &self.guid == guid {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(guid))
    }

    pub fn parent_of(&self, guid: &Guid) -> Option<&Node> {
        if self.children.iter().any(|child| &child.guid == guid) {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.parent_of(guid))
    }

    fn detach(&mut self, guid: &Guid) -> Option<Node> {
        if let Some(index) = self.children.iter().position(|child| &child.guid == guid) {
            return Some(self.children.remove(index));
        }
        self.children.iter_mut().find_map(|child| child.detach(guid))
    }
}

pub struct MemoryProject {
    app: Weak<MemoryApplication>,
    root: RefCell<Node>,
    path: RefCell<Option<PathBuf>>,
    viewer_state: RefCell<Value>,
    playing: Cell<bool>,
}

impl MemoryProject {
    fn new(app: Weak<MemoryApplication>, root: Node, path: Option<PathBuf>) -> Self {
        Self {
            app,
            root: RefCell::new(root),
            path: RefCell::new(path),
            viewer_state: RefCell::new(Value::Null),
            playing: Cell::new(false),
        }
    }

    /// A copy of the whole tree.
    pub fn snapshot(&self) -> Node {
        self.root.borrow().clone()
    }

    pub fn find(&self, guid: &Guid) -> Option<Node> {
        self.root.borrow().find(guid).cloned()
    }

    fn contains(&self, guid: &Guid) -> bool {
        self.root.borrow().find(guid).is_some()
    }

    /// Add a node without raising events, for building fixtures.
    pub fn insert(&self, parent: &Guid, node: Node) -> Result<(), ModelError> {
        let mut root = self.root.borrow_mut();
        let parent = root
            .find_mut(parent)
            .ok_or_else(|| ModelError::NotFound(parent.clone()))?;
        parent.children.push(node);
        Ok(())
    }

    pub fn start_playback(&self) {
        self.playing.set(true);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.get()
    }

    fn emit(&self, event: ModelEvent) {
        if let Some(app) = self.app.upgrade() {
            app.events.emit(&event);
        }
    }
}

impl Project for MemoryProject {
    fn guid(&self) -> Guid {
        self.root.borrow().guid.clone()
    }

    fn name(&self) -> String {
        self.root.borrow().name.clone()
    }

    fn path(&self) -> Option<PathBuf> {
        self.path.borrow().clone()
    }

    fn set_path(&self, path: Option<PathBuf>) {
        self.path.replace(path);
    }

    fn save_as(&self, path: &Path, flags: SaveFlags) -> Result<(), ModelError> {
        let bytes = serde_json::to_vec_pretty(&*self.root.borrow())?;
        std::fs::write(path, bytes)?;
        if !flags.as_copy {
            self.path.replace(Some(path.to_path_buf()));
        }
        Ok(())
    }

    fn stop_playback(&self) {
        self.playing.set(false);
    }

    fn viewer_state(&self) -> Value {
        self.viewer_state.borrow().clone()
    }

    fn set_viewer_state(&self, state: Value) -> Result<(), ModelError> {
        self.viewer_state.replace(state);
        Ok(())
    }
}

/// Handle to one node of an open project.
struct MemoryEntity {
    project: Rc<MemoryProject>,
    guid: Guid,
    kind: EntityKind,
}

impl MemoryEntity {
    fn not_found(&self) -> ModelError {
        ModelError::NotFound(self.guid.clone())
    }

    fn set_property(&self, key: &str, value: Value) -> Result<(), ModelError> {
        let mut root = self.project.root.borrow_mut();
        let node = root.find_mut(&self.guid).ok_or_else(|| self.not_found())?;
        node.properties.insert(key.to_string(), value);
        Ok(())
    }

    fn unsupported(&self, operation: &'static str) -> ModelError {
        ModelError::Unsupported {
            kind: self.kind,
            operation,
        }
    }
}

impl Entity for MemoryEntity {
    fn guid(&self) -> Guid {
        self.guid.clone()
    }

    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn serialize(&self) -> Result<Vec<u8>, ModelError> {
        let root = self.project.root.borrow();
        let node = root.find(&self.guid).ok_or_else(|| self.not_found())?;
        Ok(serde_json::to_vec(node)?)
    }

    fn deserialize(&self, blob: &[u8]) -> Result<(), ModelError> {
        let replacement: Node = serde_json::from_slice(blob)?;
        if replacement.guid != self.guid {
            return Err(ModelError::GuidMismatch {
                expected: self.guid.clone(),
                found: replacement.guid,
            });
        }
        {
            let mut root = self.project.root.borrow_mut();
            let node = root.find_mut(&self.guid).ok_or_else(|| self.not_found())?;
            *node = replacement;
        }
        self.project.emit(ModelEvent::StructureEdited {
            entity: self.guid.clone(),
        });
        Ok(())
    }

    fn apply(&self, change: Change) -> Result<(), ModelError> {
        let entity = self.guid.clone();
        let event = match change {
            Change::SetActiveVersion(version) => {
                if !matches!(self.kind, EntityKind::VersionStack | EntityKind::Clip) {
                    return Err(self.unsupported("active version"));
                }
                self.set_property("active_version", Value::String(version.clone()))?;
                ModelEvent::ActiveVersionChanged { entity, version }
            }
            Change::SetEnabled(enabled) => {
                self.set_property("enabled", Value::Bool(enabled))?;
                ModelEvent::EnabledChanged { entity, enabled }
            }
            Change::SetRange { start, end } => {
                self.set_property("range", serde_json::json!([start, end]))?;
                ModelEvent::RangeChanged { entity, start, end }
            }
            Change::SetParameter { name, value } => {
                if self.kind != EntityKind::Effect {
                    return Err(self.unsupported("parameters"));
                }
                {
                    let mut root = self.project.root.borrow_mut();
                    let node = root.find_mut(&self.guid).ok_or_else(|| self.not_found())?;
                    let parameters = node
                        .properties
                        .entry("parameters")
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !parameters.is_object() {
                        *parameters = Value::Object(Map::new());
                    }
                    if let Value::Object(parameters) = parameters {
                        parameters.insert(name.clone(), value.clone());
                    }
                }
                ModelEvent::ParameterChanged {
                    effect: entity,
                    name,
                    value,
                }
            }
            Change::Rename(name) => {
                {
                    let mut root = self.project.root.borrow_mut();
                    let node = root.find_mut(&self.guid).ok_or_else(|| self.not_found())?;
                    node.name = name.clone();
                }
                ModelEvent::BinItemRenamed { item: entity, name }
            }
            Change::InsertChild { index, blob } => {
                let child: Node = serde_json::from_slice(&blob)?;
                let item = child.guid.clone();
                {
                    let mut root = self.project.root.borrow_mut();
                    let node = root.find_mut(&self.guid).ok_or_else(|| self.not_found())?;
                    if index > node.children.len() {
                        return Err(ModelError::InvalidIndex { parent: entity, index });
                    }
                    node.children.insert(index, child);
                }
                if self.kind == EntityKind::Bin {
                    ModelEvent::BinItemAdded {
                        bin: entity,
                        index,
                        item,
                    }
                } else {
                    ModelEvent::StructureEdited { entity }
                }
            }
            Change::Remove => {
                let parent = {
                    let mut root = self.project.root.borrow_mut();
                    let parent = root
                        .parent_of(&self.guid)
                        .map(|p| p.guid.clone())
                        .ok_or_else(|| self.not_found())?;
                    root.detach(&self.guid);
                    parent
                };
                if self.kind == EntityKind::BinItem {
                    ModelEvent::BinItemRemoved { item: entity }
                } else {
                    ModelEvent::StructureEdited { entity: parent }
                }
            }
            Change::MoveTo { parent, index } => {
                let index = {
                    let mut root = self.project.root.borrow_mut();
                    if root.find(&parent).is_none() {
                        return Err(ModelError::NotFound(parent));
                    }
                    let node = root.find(&self.guid).ok_or_else(|| self.not_found())?;
                    if node.find(&parent).is_some() {
                        return Err(self.unsupported("moving into itself"));
                    }
                    let node = root.detach(&self.guid).ok_or_else(|| self.not_found())?;
                    let target = root
                        .find_mut(&parent)
                        .ok_or_else(|| ModelError::NotFound(parent.clone()))?;
                    let index = index.min(target.children.len());
                    target.children.insert(index, node);
                    index
                };
                ModelEvent::BinItemMoved {
                    item: entity,
                    bin: parent,
                    index,
                }
            }
        };
        self.project.emit(event);
        Ok(())
    }
}

/// An application holding any number of in-memory projects.
pub struct MemoryApplication {
    events: EventBus,
    projects: RefCell<Vec<Rc<MemoryProject>>>,
    this: Weak<MemoryApplication>,
}

impl MemoryApplication {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            events: EventBus::new(),
            projects: RefCell::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Create an empty project; raises `ProjectCreated`.
    pub fn create_project(&self, name: &str) -> Rc<MemoryProject> {
        self.create_project_from(Node::new(EntityKind::Project, name))
    }

    /// Adopt an existing tree as a new project; raises `ProjectCreated`.
    pub fn create_project_from(&self, root: Node) -> Rc<MemoryProject> {
        let project = Rc::new(MemoryProject::new(self.this.clone(), root, None));
        self.projects.borrow_mut().push(project.clone());
        self.events.emit(&ModelEvent::ProjectCreated {
            project: project.guid(),
        });
        project
    }

    pub fn memory_project(&self, guid: &Guid) -> Option<Rc<MemoryProject>> {
        self.projects
            .borrow()
            .iter()
            .find(|project| &project.guid() == guid)
            .cloned()
    }

    pub fn project_count(&self) -> usize {
        self.projects.borrow().len()
    }
}

impl Application for MemoryApplication {
    fn events(&self) -> &EventBus {
        &self.events
    }

    fn find_item_by_guid(&self, guid: &Guid, kinds: &[EntityKind]) -> Option<Rc<dyn Entity>> {
        let projects = self.projects.borrow();
        let (project, kind) = projects.iter().find_map(|project| {
            let kind = project.root.borrow().find(guid)?.kind;
            Some((project.clone(), kind))
        })?;
        if !kinds.is_empty() && !kinds.contains(&kind) {
            return None;
        }
        Some(Rc::new(MemoryEntity {
            project,
            guid: guid.clone(),
            kind,
        }))
    }

    fn projects(&self) -> Vec<Rc<dyn Project>> {
        self.projects
            .borrow()
            .iter()
            .map(|project| project.clone() as Rc<dyn Project>)
            .collect()
    }

    fn open_project(&self, path: &Path) -> Result<Rc<dyn Project>, ModelError> {
        let bytes = std::fs::read(path)?;
        let root: Node = serde_json::from_slice(&bytes)?;
        if root.kind != EntityKind::Project {
            return Err(ModelError::Unsupported {
                kind: root.kind,
                operation: "open as project",
            });
        }
        let project = Rc::new(MemoryProject::new(
            self.this.clone(),
            root,
            Some(path.to_path_buf()),
        ));
        self.projects.borrow_mut().push(project.clone());
        tracing::debug!(project = %project.guid(), "opened {}", path.display());
        self.events.emit(&ModelEvent::ProjectOpened {
            project: project.guid(),
        });
        Ok(project)
    }

    fn close_project(&self, guid: &Guid) -> Result<(), ModelError> {
        {
            let mut projects = self.projects.borrow_mut();
            let index = projects
                .iter()
                .position(|project| &project.guid() == guid)
                .ok_or_else(|| ModelError::NotFound(guid.clone()))?;
            projects.remove(index);
        }
        self.events.emit(&ModelEvent::ProjectClosed {
            project: guid.clone(),
        });
        Ok(())
    }
}
