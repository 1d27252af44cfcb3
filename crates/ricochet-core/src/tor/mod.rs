//! Overlay transport.
//!
//! Dials peers through Tor's SOCKS5 proxy and retries outbound attempts
//! with bounded exponential backoff. The Tor daemon and the hidden service
//! publication are external; the core only needs a dialer and a local
//! listener the service forwards to.

mod connector;
mod resolver;

pub use connector::{Backoff, OnionConnector};
pub use resolver::Resolver;

/// Default SOCKS5 port of a locally running Tor daemon.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Timeout for one overlay connect attempt.
pub const CONNECT_TIMEOUT_SECS: u64 = 60;
