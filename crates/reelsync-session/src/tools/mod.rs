//! Sync tools: session-scoped bridges between the model and the dispatcher.
//!
//! A tool listens to local model events and sends messages, and applies the
//! messages it receives back to the model. Each tool owns a [`RemoteGuard`]
//! that is a child of the session's loading gate; local handlers run through
//! [`RemoteGuard::run_local`] and remote mutations through
//! [`RemoteGuard::run_remote`], so a change applied from the wire is never
//! echoed back onto it.

mod bin;
mod edit;
mod host_push;
mod peers;
mod project_push;
mod properties;

pub use bin::BinSync;
pub use edit::StructureSync;
pub use host_push::HostProjectTool;
pub use peers::{Participant, PeerRosterTool, RosterEvent};
pub use project_push::{LoadProgress, ProjectPushTool, ProjectSyncData, PushState};
pub use properties::{ActiveVersionSync, EffectParameterSync, EnabledSync, RangeSync};

use crate::dispatcher::{CallbackId, MessageDispatcher};
use crate::model::{Application, Change, EntityKind, EventKind, ModelEvent, SubscriptionId};
use reelsync_core::{Guid, Message, MessageKind, Payload, RemoteGuard, RemoveDuplicateMessagesFilter, Target};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

pub trait SyncTool {
    fn name(&self) -> &'static str;

    /// Release every callback and subscription. Idempotent.
    fn unregister(&self);
}

/// What every tool of a session shares.
#[derive(Clone)]
pub struct ToolContext {
    pub dispatcher: MessageDispatcher,
    pub app: Rc<dyn Application>,
    /// Held while a project push is being received.
    pub loading: RemoteGuard,
}

/// Dispatcher callbacks and model subscriptions held by one tool.
pub struct ToolRegistration {
    dispatcher: MessageDispatcher,
    app: Rc<dyn Application>,
    callbacks: RefCell<Vec<CallbackId>>,
    subscriptions: RefCell<Vec<SubscriptionId>>,
}

impl ToolRegistration {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            dispatcher: ctx.dispatcher.clone(),
            app: ctx.app.clone(),
            callbacks: RefCell::new(Vec::new()),
            subscriptions: RefCell::new(Vec::new()),
        }
    }

    pub fn on_message(&self, kind: MessageKind, handler: impl Fn(&Message) -> anyhow::Result<()> + 'static) {
        let id = self.dispatcher.register_callback(kind, handler);
        self.callbacks.borrow_mut().push(id);
    }

    pub fn on_event(&self, kind: EventKind, callback: impl Fn(&ModelEvent) + 'static) {
        let id = self.app.events().subscribe(kind, callback);
        self.subscriptions.borrow_mut().push(id);
    }

    pub fn release(&self) {
        for id in self.callbacks.borrow_mut().drain(..) {
            self.dispatcher.unregister_callback(id);
        }
        for id in self.subscriptions.borrow_mut().drain(..) {
            self.app.events().unsubscribe(id);
        }
    }
}

/// How a received change is applied to its entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Through the entity's mutation API.
    Apply(Change),
    /// Replace the entity with a serialized copy.
    Replace(Vec<u8>),
}

/// A change received from a peer, addressed to one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub entity: Guid,
    /// Kinds the entity may have; anything else is ignored.
    pub kinds: &'static [EntityKind],
    pub update: Update,
}

/// One replicated aspect of the model.
pub trait Replicated: 'static {
    const NAME: &'static str;

    const EVENTS: &'static [EventKind];

    const MESSAGES: &'static [MessageKind];

    /// Turn a local event into the message that announces it.
    fn outbound(app: &dyn Application, event: &ModelEvent) -> Option<Payload>;

    fn inbound(payload: &Payload) -> Option<RemoteChange>;

    fn filters() -> Vec<RemoveDuplicateMessagesFilter> {
        Vec::new()
    }
}

/// The generic local-event to message to remote-mutation tool.
pub struct EntitySyncTool<R: Replicated> {
    ctx: ToolContext,
    guard: RemoteGuard,
    registration: ToolRegistration,
    _aspect: PhantomData<R>,
}

impl<R: Replicated> EntitySyncTool<R> {
    pub fn register(ctx: &ToolContext) -> Rc<Self> {
        let tool = Rc::new(Self {
            ctx: ctx.clone(),
            guard: ctx.loading.child(),
            registration: ToolRegistration::new(ctx),
            _aspect: PhantomData,
        });
        for filter in R::filters() {
            ctx.dispatcher.add_filter(filter);
        }
        for &event in R::EVENTS {
            let weak = Rc::downgrade(&tool);
            tool.registration.on_event(event, move |event| {
                if let Some(tool) = weak.upgrade() {
                    tool.on_local_event(event);
                }
            });
        }
        for &kind in R::MESSAGES {
            let weak = Rc::downgrade(&tool);
            tool.registration.on_message(kind, move |message| match weak.upgrade() {
                Some(tool) => tool.on_remote_message(message),
                None => Ok(()),
            });
        }
        tool
    }

    pub fn guard(&self) -> &RemoteGuard {
        &self.guard
    }

    fn on_local_event(&self, event: &ModelEvent) {
        self.guard.run_local(|| {
            if let Some(payload) = R::outbound(self.ctx.app.as_ref(), event) {
                tracing::debug!(tool = R::NAME, kind = %payload.kind(), "sending local change");
                self.ctx.dispatcher.send_message(Target::Broadcast, payload);
            }
        });
    }

    fn on_remote_message(&self, message: &Message) -> anyhow::Result<()> {
        let Some(remote) = R::inbound(&message.payload) else {
            return Ok(());
        };
        let Some(entity) = self.ctx.app.find_item_by_guid(&remote.entity, remote.kinds) else {
            tracing::warn!(tool = R::NAME, entity = %remote.entity, "entity not found, ignoring remote change");
            return Ok(());
        };
        self.guard.run_remote(|| match remote.update {
            Update::Apply(change) => entity.apply(change),
            Update::Replace(blob) => entity.deserialize(&blob),
        })?;
        Ok(())
    }
}

impl<R: Replicated> SyncTool for EntitySyncTool<R> {
    fn name(&self) -> &'static str {
        R::NAME
    }

    fn unregister(&self) {
        self.registration.release();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::dispatcher::MessageSink;
    use crate::memory::MemoryApplication;
    use reelsync_core::{Frame, MessageRegistry};

    /// Captures everything a tool sends.
    #[derive(Default)]
    pub struct Outbox {
        pub sent: RefCell<Vec<Message>>,
    }

    impl MessageSink for Outbox {
        fn sender_id(&self) -> String {
            "local".into()
        }

        fn send_frames(&self, frames: Vec<Frame>) {
            let message = MessageRegistry::standard().deserialize(&frames).unwrap();
            self.sent.borrow_mut().push(message);
        }
    }

    pub struct Harness {
        pub app: Rc<MemoryApplication>,
        pub ctx: ToolContext,
        pub outbox: Rc<Outbox>,
        _sink: Rc<dyn MessageSink>,
    }

    impl Harness {
        pub fn new() -> Self {
            let app = MemoryApplication::new();
            let dispatcher = MessageDispatcher::new(MessageRegistry::standard());
            let outbox = Rc::new(Outbox::default());
            let sink: Rc<dyn MessageSink> = outbox.clone();
            dispatcher.set_sink(&sink);
            let ctx = ToolContext {
                dispatcher,
                app: app.clone(),
                loading: RemoteGuard::new(),
            };
            Self {
                app,
                ctx,
                outbox,
                _sink: sink,
            }
        }

        pub fn receive(&self, payload: Payload) {
            self.ctx
                .dispatcher
                .on_message_received(Message::new("peer", Target::Broadcast, payload));
        }

        pub fn sent(&self) -> Vec<Payload> {
            self.outbox.sent.borrow().iter().map(|m| m.payload.clone()).collect()
        }
    }
}
