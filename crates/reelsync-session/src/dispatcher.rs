//! Per-connection message dispatch.
//!
//! Received messages go through the registered filters, into a FIFO queue,
//! and are handed to every callback registered for their kind. The drain is
//! not reentrant: a message that arrives while a handler runs (say, because
//! applying a snapshot raised local events that looped back) is queued and
//! handled after every handler of the current message has returned.

use reelsync_core::{Frame, Message, MessageFilter, MessageKind, MessageRegistry, Payload, Target, apply_filters};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

/// Where serialized messages leave the process.
pub trait MessageSink {
    /// Id stamped as the sender of every outgoing message.
    fn sender_id(&self) -> String;

    fn send_frames(&self, frames: Vec<Frame>);
}

pub type Handler = Rc<dyn Fn(&Message) -> anyhow::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct DispatcherInner {
    registry: MessageRegistry,
    sink: RefCell<Option<Weak<dyn MessageSink>>>,
    queue: RefCell<VecDeque<Message>>,
    draining: Cell<bool>,
    handlers: RefCell<HashMap<MessageKind, Vec<(CallbackId, Handler)>>>,
    filters: RefCell<Vec<Box<dyn MessageFilter>>>,
    next_id: Cell<u64>,
}

#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Rc<DispatcherInner>,
}

/// Non-owning handle for callbacks that must not keep the dispatcher alive.
#[derive(Clone)]
pub struct WeakDispatcher {
    inner: Weak<DispatcherInner>,
}

impl WeakDispatcher {
    pub fn upgrade(&self) -> Option<MessageDispatcher> {
        self.inner.upgrade().map(|inner| MessageDispatcher { inner })
    }
}

struct DrainFlag<'a>(&'a Cell<bool>);

impl Drop for DrainFlag<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl MessageDispatcher {
    pub fn new(registry: MessageRegistry) -> Self {
        Self {
            inner: Rc::new(DispatcherInner {
                registry,
                sink: RefCell::new(None),
                queue: RefCell::new(VecDeque::new()),
                draining: Cell::new(false),
                handlers: RefCell::new(HashMap::new()),
                filters: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.inner.registry
    }

    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Route outgoing messages to `sink`. Only a weak reference is kept.
    pub fn set_sink(&self, sink: &Rc<dyn MessageSink>) {
        self.inner.sink.replace(Some(Rc::downgrade(sink)));
    }

    /// Append a handler for `kind`; handlers run in registration order.
    pub fn register_callback(
        &self,
        kind: MessageKind,
        handler: impl Fn(&Message) -> anyhow::Result<()> + 'static,
    ) -> CallbackId {
        let id = CallbackId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        self.inner
            .handlers
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push((id, Rc::new(handler)));
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut handlers = self.inner.handlers.borrow_mut();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.borrow().values().map(Vec::len).sum()
    }

    pub fn add_filter(&self, filter: impl MessageFilter + 'static) {
        self.inner.filters.borrow_mut().push(Box::new(filter));
    }

    pub fn on_message_received(&self, message: Message) {
        self.on_messages_received(vec![message]);
    }

    /// Filter a batch that arrived together, queue it, and drain.
    pub fn on_messages_received(&self, batch: Vec<Message>) {
        let batch = {
            let filters = self.inner.filters.borrow();
            apply_filters(&filters, batch)
        };
        self.inner.queue.borrow_mut().extend(batch);
        self.drain();
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    fn drain(&self) {
        if self.inner.draining.replace(true) {
            return;
        }
        let _flag = DrainFlag(&self.inner.draining);
        loop {
            let Some(message) = self.inner.queue.borrow_mut().pop_front() else {
                break;
            };
            let kind = message.kind();
            let handlers: Vec<Handler> = self
                .inner
                .handlers
                .borrow()
                .get(&kind)
                .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
                .unwrap_or_default();
            if handlers.is_empty() {
                tracing::debug!(kind = %kind, sender = %message.sender, "no handler registered");
                continue;
            }
            for handler in handlers {
                if let Err(e) = handler(&message) {
                    tracing::warn!(kind = %kind, sender = %message.sender, "handler failed: {:#}", e);
                }
            }
        }
    }

    /// Stamp, serialize and hand a message to the sink. Fire-and-forget.
    pub fn send_message(&self, target: Target, payload: Payload) {
        let sink = self.inner.sink.borrow().as_ref().and_then(Weak::upgrade);
        let Some(sink) = sink else {
            tracing::debug!(kind = %payload.kind(), "no connection, dropping message");
            return;
        };
        let message = Message::new(sink.sender_id(), target, payload);
        match self.inner.registry.serialize(&message) {
            Ok(frames) => sink.send_frames(frames),
            Err(e) => tracing::warn!(kind = %message.kind(), "failed to serialize: {}", e),
        }
    }

    /// Drop every handler, filter and queued message.
    pub fn clear(&self) {
        self.inner.handlers.borrow_mut().clear();
        self.inner.filters.borrow_mut().clear();
        self.inner.queue.borrow_mut().clear();
    }
}
