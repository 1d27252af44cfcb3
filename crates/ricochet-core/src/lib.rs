//! # Ricochet Core
//!
//! The peer connection core of a peer-to-peer instant messenger that talks
//! over Tor hidden services. Every identity is a long-lived hidden service;
//! contacts are other hidden services known by their 16-character onion
//! label. The core keeps at most one authenticated protocol session per
//! contact, carries a chat conversation over it with delivery
//! acknowledgement, and resolves the glare that occurs when both sides dial
//! each other at the same time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               client                    │
//! ├─────────────────────────────────────────┤
//! │  contacts  │  messaging  │   events     │
//! ├─────────────────────────────────────────┤
//! │          protocol (framing, auth)       │
//! ├─────────────────────────────────────────┤
//! │     tor (dial, backoff)  │  identity    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The Tor daemon itself, persistent chat history, and any UI are external:
//! the core consumes a SOCKS dialer, a key-value config document, and a
//! broadcast event stream.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod client;
pub mod config;
pub mod contacts;
pub mod error;
pub mod events;
pub mod identity;
pub mod messaging;
pub mod protocol;
pub mod tor;

pub use client::Client;
pub use error::{Error, Result};
pub use identity::{Identity, OnionAddress};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Virtual port every hidden service exposes for the protocol.
pub const SERVICE_PORT: u16 = 9878;

/// Time allowed for the authentication handshake on a fresh socket.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
