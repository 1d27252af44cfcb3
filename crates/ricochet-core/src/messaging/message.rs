//! Message types and validation.

use crate::error::{Error, Result};
use crate::identity::OnionAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum message text length in UTF-8 bytes.
pub const MAX_MESSAGE_TEXT_LEN: usize = 2000;

/// One endpoint of a message: the local identity or the remote contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Whether this endpoint is the local identity.
    pub is_self: bool,
    /// The endpoint's onion address, when known.
    pub address: Option<OnionAddress>,
}

impl Entity {
    /// The local identity.
    pub fn local(address: OnionAddress) -> Self {
        Self { is_self: true, address: Some(address) }
    }

    /// The remote contact.
    pub fn peer(address: OnionAddress) -> Self {
        Self { is_self: false, address: Some(address) }
    }
}

/// Delivery and read state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Outbound, accepted locally and handed to the session's write queue.
    Sending,
    /// Outbound, waiting for a session to come up.
    Queued,
    /// Outbound, written to the wire; no ack yet.
    Sent,
    /// Outbound, acknowledged by the peer.
    Delivered,
    /// Read: inbound messages the user has seen, or outbound messages the
    /// peer hinted it has read.
    Read,
    /// Inbound, not yet seen by the user.
    Unread,
    /// Delivery failed.
    Error,
}

impl MessageStatus {
    /// Whether this status counts toward the unread counter.
    pub fn is_unread(&self) -> bool {
        matches!(self, MessageStatus::Unread)
    }
}

/// A chat message in a conversation backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender-assigned identifier; unique within the conversation, 0 is
    /// reserved.
    pub identifier: u32,
    /// Who sent it.
    pub sender: Option<Entity>,
    /// Who it was addressed to.
    pub recipient: Option<Entity>,
    /// Local receive or compose time. Sender-supplied times are not
    /// trusted and never carried on the wire.
    pub timestamp: DateTime<Utc>,
    /// Message text.
    pub text: String,
    /// Current status.
    pub status: MessageStatus,
}

impl Message {
    /// Construct an outbound message from the local identity to a contact.
    pub fn outbound(identifier: u32, my: OnionAddress, contact: OnionAddress, text: &str, status: MessageStatus) -> Self {
        Self {
            identifier,
            sender: Some(Entity::local(my)),
            recipient: Some(Entity::peer(contact)),
            timestamp: Utc::now(),
            text: text.to_owned(),
            status,
        }
    }

    /// Construct an inbound message from a contact to the local identity.
    pub fn inbound(identifier: u32, my: OnionAddress, contact: OnionAddress, text: &str, status: MessageStatus) -> Self {
        Self {
            identifier,
            sender: Some(Entity::peer(contact)),
            recipient: Some(Entity::local(my)),
            timestamp: Utc::now(),
            text: text.to_owned(),
            status,
        }
    }

    /// Whether the local identity sent this message.
    pub fn is_outbound(&self) -> bool {
        self.sender.as_ref().is_some_and(|e| e.is_self)
    }
}

/// Validate that a message is well-formed and belongs to the conversation
/// between `my_address` and `contact_address`.
pub(crate) fn validate_message(
    msg: &Message,
    my_address: &OnionAddress,
    contact_address: &OnionAddress,
) -> Result<()> {
    let (Some(sender), Some(recipient)) = (&msg.sender, &msg.recipient) else {
        return Err(Error::Validation("message entities are incomplete".into()));
    };

    let (local, remote) = if sender.is_self {
        (sender, recipient)
    } else {
        (recipient, sender)
    };

    if !local.is_self || local.address.as_ref().is_some_and(|a| a != my_address) {
        return Err(Error::Validation("self entity does not match the local identity".into()));
    }
    if remote.is_self || remote.address.as_ref() != Some(contact_address) {
        return Err(Error::Validation("remote entity does not match this contact".into()));
    }

    if msg.is_outbound() && msg.status == MessageStatus::Unread {
        return Err(Error::Validation("outbound messages cannot be unread".into()));
    }

    if msg.text.is_empty() || msg.text.len() > MAX_MESSAGE_TEXT_LEN {
        return Err(Error::Validation("message text length is unacceptable".into()));
    }

    Ok(())
}
