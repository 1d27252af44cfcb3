//! Conversation model.
//!
//! Each contact owns one conversation: an ordered in-memory backlog with
//! unread bookkeeping, an outbound queue for messages composed while
//! offline, and a trimming policy that never discards unread messages.

mod conversation;
mod message;

pub use conversation::{Conversation, BACKLOG_CONTEXT, BACKLOG_HARD_LIMIT, BACKLOG_SOFT_LIMIT};
pub use message::{Entity, Message, MessageStatus, MAX_MESSAGE_TEXT_LEN};
