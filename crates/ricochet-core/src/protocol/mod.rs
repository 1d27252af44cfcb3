//! Framed multi-channel protocol over one byte stream.
//!
//! A session multiplexes typed channels over a single overlay connection.
//! Channel 0 is the control channel used to open and close the others.
//! The channel types the core speaks:
//!
//! - `auth.hidden-service` — proof that the peer controls the onion label
//!   it claims.
//! - `im.ricochet.contact.request` — greeting handshake from an unknown peer.
//! - `im.ricochet.chat` — chat delivery with per-message acks.

pub mod auth;
pub mod frame;
pub mod session;
pub mod wire;

pub use frame::{Frame, FrameReader, CONTROL_CHANNEL, MAX_FRAME_LEN};
pub use session::{
    BoxStream, Direction, Session, SessionEvent, SessionEventKind, SessionId, SessionReader,
};
pub use wire::{AuthMessage, ChannelType, ChatMessage, ControlMessage, RequestMessage, RequestStatus};
