//! Per-contact conversation state.

use super::message::{validate_message, Message, MessageStatus};
use crate::events::{ConversationEventKind, Event, EventPublisher};
use crate::identity::OnionAddress;
use crate::protocol::Session;
use crate::error::Result;
use tracing::{debug, warn};

/// Backlog size above which read messages are trimmed.
pub const BACKLOG_SOFT_LIMIT: usize = 100;

/// Backlog size that is never exceeded.
pub const BACKLOG_HARD_LIMIT: usize = 200;

/// Messages of context kept before the oldest unread message when
/// trimming.
pub const BACKLOG_CONTEXT: usize = 3;

/// The conversation's attachment to the currently adopted session.
struct ChatLink {
    session: Session,
    channel: Option<u16>,
}

impl ChatLink {
    fn new(session: Session) -> Self {
        Self { session, channel: None }
    }

    async fn channel(&mut self) -> Result<u16> {
        if let Some(channel) = self.channel {
            return Ok(channel);
        }
        let channel = self.session.open_chat_channel().await?;
        self.channel = Some(channel);
        Ok(channel)
    }

    async fn transmit(&mut self, identifier: u32, text: &str) -> Result<()> {
        let channel = self.channel().await?;
        self.session.send_chat_message(channel, identifier, text).await
    }

    async fn send_mark_read(&mut self, last_received: u32) -> Result<()> {
        let channel = self.channel().await?;
        self.session.send_mark_read(channel, last_received).await
    }
}

/// Ordered message backlog for one contact, with unread bookkeeping, an
/// offline send queue, and the trimming policy.
pub struct Conversation {
    my_address: OnionAddress,
    contact_address: OnionAddress,
    events: EventPublisher,
    messages: Vec<Message>,
    unread: usize,
    active: bool,
    next_identifier: u32,
    last_read_identifier: Option<u32>,
    link: Option<ChatLink>,
}

impl Conversation {
    pub(crate) fn new(my_address: OnionAddress, contact_address: OnionAddress, events: EventPublisher) -> Self {
        Self {
            my_address,
            contact_address,
            events,
            messages: Vec::new(),
            unread: 0,
            active: false,
            next_identifier: 1,
            last_read_identifier: None,
            link: None,
        }
    }

    /// Enqueue an outbound message.
    ///
    /// The message is appended with status [`MessageStatus::Sent`] when a
    /// session is attached and the frame was handed off, or
    /// [`MessageStatus::Queued`] otherwise. Delivery confirmation arrives
    /// asynchronously through the peer's ack. Returns the assigned
    /// identifier.
    pub async fn send(&mut self, text: &str) -> Result<u32> {
        let identifier = self.next_identifier;
        let mut msg = Message::outbound(
            identifier,
            self.my_address.clone(),
            self.contact_address.clone(),
            text,
            MessageStatus::Sending,
        );
        validate_message(&msg, &self.my_address, &self.contact_address)?;
        self.next_identifier = self.next_identifier.checked_add(1).unwrap_or(1);

        msg.status = match self.link.as_mut() {
            Some(link) => match link.transmit(identifier, text).await {
                Ok(()) => MessageStatus::Sent,
                Err(e) => {
                    debug!(error = %e, "chat transmit failed, queueing message");
                    MessageStatus::Queued
                }
            },
            None => MessageStatus::Queued,
        };

        self.messages.push(msg.clone());
        self.trim();
        self.publish(ConversationEventKind::Sent, msg);
        Ok(identifier)
    }

    /// Append an inbound message delivered by the protocol session.
    /// Messages failing validation are dropped.
    pub async fn receive(&mut self, identifier: u32, text: &str) {
        let status = if self.active { MessageStatus::Read } else { MessageStatus::Unread };
        let msg = Message::inbound(
            identifier,
            self.my_address.clone(),
            self.contact_address.clone(),
            text,
            status,
        );
        if let Err(e) = validate_message(&msg, &self.my_address, &self.contact_address) {
            warn!(error = %e, "rejected inbound message");
            return;
        }
        if msg.status.is_unread() {
            self.unread += 1;
        }
        self.messages.push(msg.clone());
        self.trim();
        self.publish(ConversationEventKind::Received, msg);
        if self.active {
            self.mark_read_through(identifier).await;
        }
    }

    /// Record the peer's delivery ack (or failure) for an outbound
    /// message. Repeated acks for the same identifier are no-ops.
    pub fn update_sent_status(&mut self, identifier: u32, ok: bool) {
        let target = if ok { MessageStatus::Delivered } else { MessageStatus::Error };
        let Some(idx) = self
            .messages
            .iter()
            .rposition(|m| m.is_outbound() && m.identifier == identifier)
        else {
            debug!(identifier, "ack for unknown outbound message ignored");
            return;
        };
        if self.messages[idx].status == target {
            return;
        }
        self.messages[idx].status = target;
        let snapshot = self.messages[idx].clone();
        self.publish(ConversationEventKind::Updated, snapshot);
    }

    /// Replace the stored message matching the update's direction and
    /// identifier, keeping the unread counter consistent.
    pub fn update_message(&mut self, updated: Message) {
        if let Err(e) = validate_message(&updated, &self.my_address, &self.contact_address) {
            warn!(error = %e, "rejected message update");
            return;
        }
        for i in (0..self.messages.len()).rev() {
            let msg = &self.messages[i];
            if msg.is_outbound() != updated.is_outbound() || msg.identifier != updated.identifier {
                continue;
            }
            match (msg.status.is_unread(), updated.status.is_unread()) {
                (true, false) => self.unread -= 1,
                (false, true) => self.unread += 1,
                _ => {}
            }
            self.messages[i] = updated.clone();
            self.publish(ConversationEventKind::Updated, updated);
            return;
        }
        debug!("ignoring update for unknown message");
    }

    /// Mark the conversation read.
    ///
    /// Finds the most recent unread inbound message, stopping at the first
    /// read or outbound message, marks everything read, records the
    /// identifier, and dispatches a read hint to the peer session when one
    /// is attached. Calling again with nothing unread changes nothing.
    pub async fn mark_as_read(&mut self) {
        let mut found = None;
        for msg in self.messages.iter().rev() {
            if msg.is_outbound() || msg.status == MessageStatus::Read {
                break;
            }
            if msg.status.is_unread() {
                found = Some(msg.identifier);
                break;
            }
        }
        if let Some(identifier) = found {
            self.mark_read_through(identifier).await;
        }
    }

    async fn mark_read_through(&mut self, identifier: u32) {
        let mut updates = Vec::new();
        for msg in self.messages.iter_mut() {
            if msg.status.is_unread() {
                msg.status = MessageStatus::Read;
                updates.push(msg.clone());
            }
        }
        self.unread = 0;
        self.last_read_identifier = Some(identifier);
        for msg in updates {
            self.publish(ConversationEventKind::Updated, msg);
        }
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.send_mark_read(identifier).await {
                debug!(error = %e, "read hint not delivered");
            }
        }
    }

    /// Apply a read hint from the peer: outbound messages up to the hinted
    /// identifier that were delivered are promoted to read.
    pub(crate) fn apply_read_hint(&mut self, last_received: u32) {
        let mut updates = Vec::new();
        for msg in self.messages.iter_mut() {
            if msg.is_outbound()
                && msg.identifier <= last_received
                && matches!(msg.status, MessageStatus::Sent | MessageStatus::Delivered)
            {
                msg.status = MessageStatus::Read;
                updates.push(msg.clone());
            }
        }
        for msg in updates {
            self.publish(ConversationEventKind::Updated, msg);
        }
    }

    /// Toggle whether the user is attending to this conversation. On
    /// activation everything is marked read and the backlog context a UI
    /// would display is returned, starting [`BACKLOG_CONTEXT`] messages
    /// before the first unread one.
    pub async fn set_active(&mut self, active: bool) -> Vec<Message> {
        if active == self.active {
            return Vec::new();
        }
        self.active = active;
        if !active {
            return Vec::new();
        }
        let start = self.context_start();
        let context = self.messages[start..].to_vec();
        self.mark_as_read().await;
        context
    }

    fn context_start(&self) -> usize {
        for (i, msg) in self.messages.iter().enumerate() {
            if msg.status.is_unread() {
                return i.saturating_sub(BACKLOG_CONTEXT);
            }
        }
        self.messages.len().saturating_sub(BACKLOG_CONTEXT)
    }

    /// Transmit all queued messages in order on the attached session.
    /// Only messages still queued are touched, so re-adoption cannot
    /// double-send. Returns the number transmitted.
    pub(crate) async fn send_queued_messages(&mut self) -> usize {
        let Some(link) = self.link.as_mut() else {
            return 0;
        };
        let mut sent = 0;
        let mut updates = Vec::new();
        for msg in self.messages.iter_mut() {
            if msg.status != MessageStatus::Queued {
                continue;
            }
            match link.transmit(msg.identifier, &msg.text).await {
                Ok(()) => {
                    msg.status = MessageStatus::Sent;
                    sent += 1;
                    updates.push(msg.clone());
                }
                Err(e) => {
                    debug!(error = %e, "queued send failed, keeping message queued");
                    break;
                }
            }
        }
        for msg in updates {
            self.publish(ConversationEventKind::Updated, msg);
        }
        sent
    }

    pub(crate) fn attach(&mut self, session: Session) {
        self.link = Some(ChatLink::new(session));
    }

    pub(crate) fn detach(&mut self) {
        self.link = None;
    }

    /// Forget the open chat channel after the peer closed or refused it;
    /// the next send opens a fresh one.
    pub(crate) fn reset_chat_channel(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.channel = None;
        }
    }

    /// The backlog, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of unread messages in the backlog.
    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Identifier recorded by the most recent mark-as-read.
    pub fn last_read_identifier(&self) -> Option<u32> {
        self.last_read_identifier
    }

    /// Whether the conversation is currently active.
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn publish(&self, kind: ConversationEventKind, message: Message) {
        self.events.publish(Event::Conversation {
            kind,
            contact: self.contact_address.clone(),
            message,
        });
    }

    /// Backlog trimming, applied after every append.
    ///
    /// Above the hard limit the oldest overflow is discarded
    /// unconditionally. Otherwise, above the soft limit, everything before
    /// the context window of the oldest unread message is dropped; with
    /// nothing unread the backlog shrinks to the soft limit.
    fn trim(&mut self) {
        if self.messages.len() > BACKLOG_HARD_LIMIT {
            let excess = self.messages.len() - BACKLOG_HARD_LIMIT;
            self.messages.drain(..excess);
            self.recount_unread();
        } else if self.messages.len() > BACKLOG_SOFT_LIMIT {
            let keep_from = match self.messages.iter().position(|m| m.status.is_unread()) {
                Some(first_unread) => first_unread.saturating_sub(BACKLOG_CONTEXT),
                None => self.messages.len() - BACKLOG_SOFT_LIMIT,
            };
            self.messages.drain(..keep_from);
        }
    }

    fn recount_unread(&mut self) {
        self.unread = self.messages.iter().filter(|m| m.status.is_unread()).count();
    }
}
