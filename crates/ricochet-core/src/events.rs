//! Event fan-out to subscribers.
//!
//! State deltas are published over a broadcast channel after the change
//! they describe is visible; publishing never blocks, and subscribers that
//! fall behind lose the oldest events.

use crate::contacts::ContactSnapshot;
use crate::contacts::IncomingRequestInfo;
use crate::identity::OnionAddress;
use crate::messaging::Message;
use tokio::sync::broadcast;

/// Capacity of the broadcast buffer.
const EVENT_CAPACITY: usize = 128;

/// Kinds of contact events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactEventKind {
    /// Emitted for each contact loaded from config at startup.
    Populate,
    /// A contact was added.
    Add,
    /// A contact's state changed.
    Update,
    /// A contact was deleted.
    Delete,
}

/// Kinds of conversation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationEventKind {
    /// An outbound message was appended to the backlog.
    Sent,
    /// An inbound message was appended to the backlog.
    Received,
    /// An existing message changed status.
    Updated,
}

/// A state delta visible to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A contact changed.
    Contact {
        /// What happened.
        kind: ContactEventKind,
        /// Snapshot taken after the change.
        contact: ContactSnapshot,
    },
    /// An unknown peer asked to become a contact.
    InboundRequest {
        /// The request as received (filtered).
        request: IncomingRequestInfo,
    },
    /// A conversation changed.
    Conversation {
        /// What happened.
        kind: ConversationEventKind,
        /// The contact the conversation belongs to.
        contact: OnionAddress,
        /// The message affected, after the change.
        message: Message,
    },
}

/// Non-blocking fan-out of [`Event`]s.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    /// Create a publisher with the default buffer size.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. A send with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
