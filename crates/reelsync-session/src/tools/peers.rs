//! Who is in the session.
//!
//! Every `Connect` the server forwards carries the participant's profile;
//! `Disconnected` removes them again. User-facing `Notification`s are
//! surfaced through the same observable.

use super::{SyncTool, ToolContext, ToolRegistration};
use reelsync_core::{MessageKind, ObserverId, Payload, Subject, Target};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub color: Option<[u8; 3]>,
    /// The profile exactly as the participant sent it.
    pub data: Value,
}

impl Participant {
    /// Read `{"name": ..., "color": [r, g, b]}`, tolerating anything else.
    pub fn from_client_data(id: &str, data: Value) -> Self {
        let name = data["name"].as_str().map(str::to_string).unwrap_or_else(|| id.to_string());
        let color = data["color"].as_array().and_then(|channels| {
            let channels: Vec<u8> = channels
                .iter()
                .filter_map(|c| c.as_u64().and_then(|c| u8::try_from(c).ok()))
                .collect();
            <[u8; 3]>::try_from(channels).ok()
        });
        Self {
            id: id.to_string(),
            name,
            color,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RosterEvent {
    Joined(Participant),
    Left(Participant),
    Notification { from: String, message: String },
}

pub struct PeerRosterTool {
    ctx: ToolContext,
    registration: ToolRegistration,
    participants: RefCell<BTreeMap<String, Participant>>,
    events: Subject<RosterEvent>,
}

impl PeerRosterTool {
    pub fn register(ctx: &ToolContext) -> Rc<Self> {
        let tool = Rc::new(Self {
            ctx: ctx.clone(),
            registration: ToolRegistration::new(ctx),
            participants: RefCell::new(BTreeMap::new()),
            events: Subject::new(),
        });

        let weak = Rc::downgrade(&tool);
        tool.registration.on_message(MessageKind::Connect, move |message| {
            if let (Some(tool), Payload::Connect { client_data, .. }) = (weak.upgrade(), &message.payload) {
                tool.add(Participant::from_client_data(&message.sender, client_data.clone()));
            }
            Ok(())
        });

        let weak = Rc::downgrade(&tool);
        tool.registration.on_message(MessageKind::Disconnected, move |message| {
            if let (Some(tool), Payload::Disconnected { disconnected }) = (weak.upgrade(), &message.payload) {
                let left = tool.participants.borrow_mut().remove(disconnected);
                match left {
                    Some(participant) => {
                        tracing::info!(client = %participant.id, "{} left the session", participant.name);
                        tool.events.notify(&RosterEvent::Left(participant));
                    }
                    None => tracing::debug!(client = %disconnected, "unknown participant left"),
                }
            }
            Ok(())
        });

        let weak = Rc::downgrade(&tool);
        tool.registration.on_message(MessageKind::Notification, move |message| {
            if let (Some(tool), Payload::Notification { message: text }) = (weak.upgrade(), &message.payload) {
                tool.events.notify(&RosterEvent::Notification {
                    from: message.sender.clone(),
                    message: text.clone(),
                });
            }
            Ok(())
        });
        tool
    }

    /// Record a participant; the local one is added by the session itself.
    pub fn add(&self, participant: Participant) {
        tracing::info!(client = %participant.id, "{} joined the session", participant.name);
        self.participants
            .borrow_mut()
            .insert(participant.id.clone(), participant.clone());
        self.events.notify(&RosterEvent::Joined(participant));
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.participants.borrow().values().cloned().collect()
    }

    pub fn participant(&self, id: &str) -> Option<Participant> {
        self.participants.borrow().get(id).cloned()
    }

    /// Show `message` to everyone else.
    pub fn notify_all(&self, message: &str) {
        self.ctx.dispatcher.send_message(
            Target::Broadcast,
            Payload::Notification {
                message: message.to_string(),
            },
        );
    }

    pub fn subscribe(&self, observer: impl Fn(&RosterEvent) + 'static) -> ObserverId {
        self.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.events.unsubscribe(id)
    }
}

impl SyncTool for PeerRosterTool {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn unregister(&self) {
        self.registration.release();
        self.events.clear();
    }
}
