//! Error types for the connection core.
//!
//! The taxonomy mirrors the recovery policy: transport and protocol errors
//! are retried or contained inside the owning agent, policy rejections stop
//! outbound attempts, and persistence failures are logged without rolling
//! back in-memory state.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Dial or socket failure on the overlay network. Retried with backoff.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Authentication handshake failed: bad signature, label mismatch, or
    /// the peer refused the proof.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The peer sent something inadmissible in the current session state.
    /// Terminates the session; the agent retries.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer authenticated us but does not know us, and we have no
    /// pending contact request. Outbound attempts stop.
    #[error("peer does not recognize this contact")]
    PolicyReject,

    /// A message failed conversation validation.
    #[error("invalid message: {0}")]
    Validation(String),

    /// Identity or onion address is malformed.
    #[error("identity error: {0}")]
    Identity(String),

    /// Config document could not be written.
    #[error("config persistence failed: {0}")]
    Persist(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The session or channel is closed.
    #[error("connection closed")]
    Closed,

    /// The surrounding task was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type alias using the core's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
