//! Wire framing.
//!
//! Every frame is: 2-byte big-endian total length (header included), 2-byte
//! big-endian channel id, then payload. Length is at least 4 (an empty
//! frame) and at most 65535. Malformed framing is a session-level error;
//! the connection is torn down rather than resynchronized.

use crate::error::{Error, Result};

/// Frame header size: length (2) + channel id (2).
pub const FRAME_HEADER_LEN: usize = 4;

/// Maximum total frame length.
pub const MAX_FRAME_LEN: usize = 0xffff;

/// Maximum payload bytes in one frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_HEADER_LEN;

/// The control channel id, reserved for open/close messages.
pub const CONTROL_CHANNEL: u16 = 0;

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination channel.
    pub channel: u16,
    /// Payload bytes, typed per the channel's type.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame, rejecting oversized payloads.
    pub fn new(channel: u16, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }
        Ok(Self { channel, payload })
    }

    /// Serialize for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let total = FRAME_HEADER_LEN + self.payload.len();
        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&(total as u16).to_be_bytes());
        bytes.extend_from_slice(&self.channel.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Streaming frame parser.
///
/// Accumulates received bytes and yields complete frames. On a framing
/// error the caller must discard the connection; the buffer is left
/// cleared.
#[derive(Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract one complete frame.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn try_read(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < 2 {
            return Ok(None);
        }
        let total = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if total < FRAME_HEADER_LEN {
            self.buffer.clear();
            return Err(Error::Protocol(format!("frame length {} below header size", total)));
        }
        if self.buffer.len() < total {
            return Ok(None);
        }
        let frame_bytes: Vec<u8> = self.buffer.drain(..total).collect();
        let channel = u16::from_be_bytes([frame_bytes[2], frame_bytes[3]]);
        Ok(Some(Frame {
            channel,
            payload: frame_bytes[FRAME_HEADER_LEN..].to_vec(),
        }))
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
