//! Full-project handoff.
//!
//! Pushing a project saves a fresh snapshot copy, sends the file, then sends
//! the viewer state the file does not capture. A batch of pushes is wrapped
//! in `ProjectPushBegin`/`ProjectPushEnd`; the receiver holds the session's
//! loading gate from begin to end so no tool reacts to the projects being
//! replaced underneath it.

use super::{SyncTool, ToolContext, ToolRegistration};
use crate::model::{Project, SaveFlags};
use anyhow::Context;
use reelsync_core::{Guid, MessageKind, ObserverId, Payload, RemoteScope, Subject, Target};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Idle,
    Pushing,
    Loading,
}

/// A project taking part in the session.
#[derive(Clone)]
pub struct ProjectSyncData {
    pub project: Rc<dyn Project>,
    pub guid: Guid,
    /// Where the project lived before it joined the session.
    pub original_path: Option<PathBuf>,
    /// The latest snapshot written or received.
    pub snapshot_path: Option<PathBuf>,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub received: usize,
    pub expected: usize,
    pub percent: u8,
}

impl LoadProgress {
    fn new(received: usize, expected: usize) -> Self {
        let percent = if expected == 0 {
            100
        } else {
            (received.min(expected) * 100 / expected) as u8
        };
        Self {
            received,
            expected,
            percent,
        }
    }
}

pub struct ProjectPushTool {
    ctx: ToolContext,
    temp_dir: PathBuf,
    registration: ToolRegistration,
    state: Cell<PushState>,
    records: RefCell<BTreeMap<Guid, ProjectSyncData>>,
    loading: RefCell<Option<RemoteScope>>,
    expected: Cell<usize>,
    received: Cell<usize>,
    progress: Subject<LoadProgress>,
}

impl ProjectPushTool {
    /// `temp_dir` receives every snapshot this participant writes.
    pub fn register(ctx: &ToolContext, temp_dir: PathBuf) -> Rc<Self> {
        let tool = Rc::new(Self {
            ctx: ctx.clone(),
            temp_dir,
            registration: ToolRegistration::new(ctx),
            state: Cell::new(PushState::Idle),
            records: RefCell::new(BTreeMap::new()),
            loading: RefCell::new(None),
            expected: Cell::new(0),
            received: Cell::new(0),
            progress: Subject::new(),
        });
        let kinds = [
            MessageKind::ProjectPushBegin,
            MessageKind::ProjectPush,
            MessageKind::ProjectViewerState,
            MessageKind::ProjectPushEnd,
            MessageKind::ProjectClose,
        ];
        for kind in kinds {
            let weak = Rc::downgrade(&tool);
            tool.registration.on_message(kind, move |message| match weak.upgrade() {
                Some(tool) => tool.on_message(&message.payload),
                None => Ok(()),
            });
        }
        tool
    }

    pub fn state(&self) -> PushState {
        self.state.get()
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Make a locally open project part of the session.
    pub fn track(&self, project: Rc<dyn Project>) {
        let guid = project.guid();
        let mut records = self.records.borrow_mut();
        if records.contains_key(&guid) {
            return;
        }
        tracing::debug!(project = %guid, "tracking project");
        records.insert(
            guid.clone(),
            ProjectSyncData {
                original_path: project.path(),
                project,
                guid,
                snapshot_path: None,
                version: 0,
            },
        );
    }

    pub fn forget(&self, guid: &Guid) -> Option<ProjectSyncData> {
        self.records.borrow_mut().remove(guid)
    }

    pub fn is_tracked(&self, guid: &Guid) -> bool {
        self.records.borrow().contains_key(guid)
    }

    pub fn record(&self, guid: &Guid) -> Option<ProjectSyncData> {
        self.records.borrow().get(guid).cloned()
    }

    pub fn tracked(&self) -> Vec<Guid> {
        self.records.borrow().keys().cloned().collect()
    }

    pub fn subscribe_progress(&self, observer: impl Fn(&LoadProgress) + 'static) -> ObserverId {
        self.progress.subscribe(observer)
    }

    /// Send a fresh snapshot of each tracked project in `guids` to `target`.
    /// Returns how many were sent; a project that fails to save is skipped.
    pub fn push_projects(&self, target: Target, guids: &[Guid]) -> usize {
        let projects: Vec<Rc<dyn Project>> = {
            let records = self.records.borrow();
            guids
                .iter()
                .filter_map(|guid| match records.get(guid) {
                    Some(record) => Some(record.project.clone()),
                    None => {
                        tracing::warn!(project = %guid, "not pushing untracked project");
                        None
                    }
                })
                .collect()
        };
        if projects.is_empty() {
            return 0;
        }

        let previous = self.state.replace(PushState::Pushing);
        let dispatcher = &self.ctx.dispatcher;
        let listed = projects.iter().map(|p| p.guid()).collect();
        tracing::info!(to = %target, count = projects.len(), "pushing projects");
        dispatcher.send_message(target.clone(), Payload::ProjectPushBegin { guids: listed });

        let mut pushed = 0;
        for project in projects {
            match self.push_project(&target, project.as_ref()) {
                Ok(()) => pushed += 1,
                Err(e) => tracing::warn!(project = %project.guid(), "push failed: {:#}", e),
            }
        }
        dispatcher.send_message(target, Payload::ProjectPushEnd {});
        self.state.set(previous);
        pushed
    }

    fn push_project(&self, target: &Target, project: &dyn Project) -> anyhow::Result<()> {
        let guid = project.guid();
        project.stop_playback();

        let version = self.records.borrow().get(&guid).map_or(0, |r| r.version) + 1;
        let filename = snapshot_name(project, version);
        std::fs::create_dir_all(&self.temp_dir)
            .with_context(|| format!("creating {}", self.temp_dir.display()))?;
        let path = self.temp_dir.join(&filename);
        project.save_as(&path, SaveFlags { as_copy: true })?;
        let content = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;

        if let Some(record) = self.records.borrow_mut().get_mut(&guid) {
            record.version = version;
            record.snapshot_path = Some(path);
        }
        let dispatcher = &self.ctx.dispatcher;
        dispatcher.send_message(
            target.clone(),
            Payload::ProjectPush {
                guid: guid.clone(),
                name: project.name(),
                filename,
                content,
            },
        );
        dispatcher.send_message(
            target.clone(),
            Payload::ProjectViewerState {
                guid,
                state: project.viewer_state(),
            },
        );
        Ok(())
    }

    /// Tell everyone a project left the session.
    pub fn send_close(&self, guid: &Guid) {
        self.ctx
            .dispatcher
            .send_message(Target::Broadcast, Payload::ProjectClose { guid: guid.clone() });
    }

    fn on_message(&self, payload: &Payload) -> anyhow::Result<()> {
        match payload {
            Payload::ProjectPushBegin { guids } => {
                self.begin_loading(guids);
                Ok(())
            }
            Payload::ProjectPush {
                guid,
                name,
                filename,
                content,
            } => self.ctx.loading.run_remote(|| self.receive_project(guid, name, filename, content)),
            Payload::ProjectViewerState { guid, state } => {
                let Some(project) = self.ctx.app.project(guid) else {
                    tracing::warn!(project = %guid, "viewer state for unknown project");
                    return Ok(());
                };
                self.ctx.loading.run_remote(|| project.set_viewer_state(state.clone()))?;
                Ok(())
            }
            Payload::ProjectPushEnd {} => {
                self.finish_loading();
                Ok(())
            }
            Payload::ProjectClose { guid } => self.ctx.loading.run_remote(|| self.close_project(guid)),
            _ => Ok(()),
        }
    }

    fn begin_loading(&self, guids: &[Guid]) {
        tracing::info!(count = guids.len(), "receiving projects");
        let scope = self.ctx.loading.enter();
        // A begin without an end replaces the earlier scope.
        self.loading.replace(Some(scope));
        self.state.set(PushState::Loading);
        self.expected.set(guids.len());
        self.received.set(0);

        for guid in guids {
            if self.ctx.app.project(guid).is_some() {
                tracing::debug!(project = %guid, "closing obsolete copy");
                if let Err(e) = self.ctx.app.close_project(guid) {
                    tracing::warn!(project = %guid, "failed to close obsolete copy: {}", e);
                }
            }
        }
        self.progress.notify(&LoadProgress::new(0, guids.len()));
    }

    fn receive_project(&self, guid: &Guid, name: &str, filename: &str, content: &[u8]) -> anyhow::Result<()> {
        let Some(filename) = Path::new(filename).file_name() else {
            anyhow::bail!("invalid snapshot file name {:?}", filename);
        };
        std::fs::create_dir_all(&self.temp_dir)
            .with_context(|| format!("creating {}", self.temp_dir.display()))?;
        let path = self.temp_dir.join(filename);
        std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;

        if self.ctx.app.project(guid).is_some() {
            self.ctx.app.close_project(guid)?;
        }
        let project = self.ctx.app.open_project(&path)?;
        if &project.guid() != guid {
            tracing::warn!(expected = %guid, found = %project.guid(), "snapshot holds another project");
        }

        let mut records = self.records.borrow_mut();
        match records.get_mut(guid) {
            Some(record) => {
                project.set_path(record.original_path.clone().or_else(|| Some(path.clone())));
                record.project = project;
                record.snapshot_path = Some(path);
                record.version += 1;
            }
            None => {
                records.insert(
                    guid.clone(),
                    ProjectSyncData {
                        project,
                        guid: guid.clone(),
                        original_path: None,
                        snapshot_path: Some(path),
                        version: 1,
                    },
                );
            }
        }
        drop(records);
        tracing::info!(project = %guid, "received {}", name);

        self.received.set(self.received.get() + 1);
        if self.state.get() == PushState::Loading {
            self.progress
                .notify(&LoadProgress::new(self.received.get(), self.expected.get()));
        }
        Ok(())
    }

    fn finish_loading(&self) {
        if self.loading.borrow_mut().take().is_none() {
            tracing::debug!("ProjectPushEnd without a matching begin");
        }
        self.state.set(PushState::Idle);
        let expected = self.expected.get();
        self.progress
            .notify(&LoadProgress::new(expected.max(self.received.get()), expected));
        tracing::info!(received = self.received.get(), "project load finished");
    }

    fn close_project(&self, guid: &Guid) -> anyhow::Result<()> {
        let record = self.forget(guid);
        if self.ctx.app.project(guid).is_some() {
            self.ctx.app.close_project(guid)?;
        }
        if let Some(snapshot) = record.and_then(|r| r.snapshot_path) {
            if let Err(e) = std::fs::remove_file(&snapshot) {
                tracing::debug!("failed to remove {}: {}", snapshot.display(), e);
            }
        }
        Ok(())
    }
}

impl SyncTool for ProjectPushTool {
    fn name(&self) -> &'static str {
        "project-push"
    }

    fn unregister(&self) {
        self.registration.release();
        self.loading.replace(None);
        self.progress.clear();
        self.state.set(PushState::Idle);
    }
}

/// `<name>.<timestamp>.v<version>.<ext>`, with the name reduced to safe characters.
fn snapshot_name(project: &dyn Project, version: u32) -> String {
    let stem: String = project
        .name()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let extension = project
        .path()
        .and_then(|p| p.extension().map(|e| e.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "project".to_string());
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    format!("{stem}.{timestamp}.v{version}.{extension}")
}
