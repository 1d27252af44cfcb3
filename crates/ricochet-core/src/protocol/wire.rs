//! Typed channel payloads.
//!
//! Each open channel carries one message stream, serialized with bincode.
//! Channel 0 carries [`ControlMessage`]s; every other channel carries the
//! message type of the channel type it was opened with.

use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Types a channel can be opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    /// `auth.hidden-service`: identity proof.
    Auth,
    /// `im.ricochet.contact.request`: greeting handshake.
    ContactRequest,
    /// `im.ricochet.chat`: chat messages and acks.
    Chat,
}

impl ChannelType {
    /// The protocol name of this channel type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Auth => "auth.hidden-service",
            ChannelType::ContactRequest => "im.ricochet.contact.request",
            ChannelType::Chat => "im.ricochet.chat",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Request to open a channel. The authentication open carries the
    /// 16-byte client cookie.
    OpenChannel {
        /// Channel id chosen by the opener (odd for the dialer, even for
        /// the acceptor).
        channel: u16,
        /// What the channel will carry.
        channel_type: ChannelType,
        /// Client cookie, present only on authentication opens.
        cookie: Option<[u8; 16]>,
    },
    /// Reply to an open request. The authentication result carries the
    /// 16-byte server cookie.
    ChannelResult {
        /// Channel id being answered.
        channel: u16,
        /// Whether the channel is now open.
        opened: bool,
        /// Error name when refused.
        error: Option<String>,
        /// Server cookie, present only on authentication results.
        cookie: Option<[u8; 16]>,
    },
    /// Close a channel. The session stays up.
    CloseChannel {
        /// Channel id to close.
        channel: u16,
    },
}

/// Messages on an `auth.hidden-service` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMessage {
    /// The dialer's identity proof.
    Proof {
        /// DER-encoded RSA public key.
        public_key: Vec<u8>,
        /// PKCS#1 v1.5 signature over the proof digest.
        signature: Vec<u8>,
    },
    /// The acceptor's verdict.
    Result {
        /// Whether the proof verified.
        accepted: bool,
        /// Whether the proven label matches a non-rejected contact.
        is_known_contact: bool,
    },
}

/// Outcome of a contact request, as reported by the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// The request was (or already had been) accepted.
    Accepted,
    /// The request is held for a user decision; the channel stays open.
    Pending,
    /// The request was rejected; the session will be closed.
    Rejected,
    /// Something went wrong on the acceptor's side.
    Error,
}

/// Messages on an `im.ricochet.contact.request` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestMessage {
    /// The greeting sent by the requesting dialer.
    Request {
        /// Nickname the requester proposes for itself.
        nickname: String,
        /// Free-text greeting.
        message: String,
    },
    /// A status update from the acceptor. `Pending` may be followed later
    /// by a final status on the same channel.
    Response {
        /// Current request status.
        status: RequestStatus,
    },
}

/// Messages on an `im.ricochet.chat` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMessage {
    /// A chat message. Identifiers are chosen by the sender, are unique
    /// within the session, and 0 is reserved.
    Message {
        /// Sender-assigned identifier.
        id: u32,
        /// Message text, 1..=2000 bytes.
        text: String,
    },
    /// Delivery acknowledgement for [`ChatMessage::Message`].
    Ack {
        /// Identifier being acknowledged.
        id: u32,
    },
    /// Hint that the sender has read everything up to this identifier.
    /// Best effort; never a guarantee.
    MarkRead {
        /// Last received identifier the sender has displayed.
        last_received: u32,
    },
}

/// Serialize a channel payload.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| Error::Protocol(format!("encode failed: {}", e)))
}

/// Deserialize a channel payload. Failure is a session-level error.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Protocol(format!("decode failed: {}", e)))
}
