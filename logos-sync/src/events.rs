//! Named-event publish/subscribe surface exposed to the editing layer.
//!
//! Dispatch is synchronous: `emit` returns once every subscriber to the
//! event's kind has run, in registration order.

use std::collections::HashMap;

use crate::presence::PresenceChange;
use crate::protocol::{Step, Telepointer};

/// Event names subscribers register against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Init,
    Connected,
    Data,
    LocalSteps,
    Presence,
    Telepointer,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Init => "init",
            EventKind::Connected => "connected",
            EventKind::Data => "data",
            EventKind::LocalSteps => "local-steps",
            EventKind::Presence => "presence",
            EventKind::Telepointer => "telepointer",
        }
    }
}

/// Events emitted by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The document was (re)set to an authoritative state.
    Init {
        sid: String,
        doc: Vec<u8>,
        version: u64,
    },
    /// The channel is connected and the provider ready.
    Connected { sid: String },
    /// Remote steps were applied to the document model.
    Data {
        steps: Vec<Step>,
        version: u64,
        /// Resolved user of each step, `None` when the origin is unknown.
        user_ids: Vec<Option<String>>,
    },
    /// Local steps captured before a snapshot resync, to be replayed.
    LocalSteps { steps: Vec<Step> },
    Presence(PresenceChange),
    Telepointer(Telepointer),
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Init { .. } => EventKind::Init,
            SyncEvent::Connected { .. } => EventKind::Connected,
            SyncEvent::Data { .. } => EventKind::Data,
            SyncEvent::LocalSteps { .. } => EventKind::LocalSteps,
            SyncEvent::Presence(_) => EventKind::Presence,
            SyncEvent::Telepointer(_) => EventKind::Telepointer,
        }
    }
}

/// Returned by `on`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Subscriber = Box<dyn FnMut(&SyncEvent) + Send>;

#[derive(Default)]
pub struct EventBus {
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, Subscriber)>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind.
    pub fn on(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&SyncEvent) + Send + 'static,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn off(&mut self, id: SubscriptionId) -> bool {
        for handlers in self.subscribers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sid, _)| *sid == id) {
                drop(handlers.remove(pos));
                return true;
            }
        }
        false
    }

    /// Remove every subscriber of `kind`.
    pub fn unsubscribe_all(&mut self, kind: EventKind) {
        self.subscribers.remove(&kind);
    }

    /// Deliver `event` to its subscribers, in registration order.
    pub fn emit(&mut self, event: &SyncEvent) {
        if let Some(handlers) = self.subscribers.get_mut(&event.kind()) {
            for (_, handler) in handlers.iter_mut() {
                handler(event);
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len)
    }
}
