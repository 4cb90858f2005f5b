//! # Stream Framing
//!
//! ```text
//! ┌────────────────┬──────────────┬───────────────┐
//! │ length (u32 LE)│ id (u16 LE)  │ payload       │
//! └────────────────┴──────────────┴───────────────┘
//!                   └──────── length bytes ───────┘
//! ```
//!
//! Reads arrive in arbitrary chunks; [`FrameDecoder`] accumulates them and
//! yields whole frames.

use skein_core::codec::FRAME_HEADER_SIZE;
use thiserror::Error;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Framing violations. Any of these tears the connection down.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than a message id.
    #[error("frame length {0} is below the {FRAME_HEADER_SIZE}-byte minimum")]
    TooShort(u32),

    /// Frame longer than the configured limit.
    #[error("frame length {length} exceeds limit {max}")]
    TooLong {
        /// Announced length.
        length: u32,
        /// Configured limit.
        max: usize,
    },
}

/// Encodes the length prefix for a frame body of `len` bytes.
#[inline]
#[must_use]
pub fn length_prefix(len: usize) -> Option<[u8; LENGTH_PREFIX_SIZE]> {
    u32::try_from(len).ok().map(u32::to_le_bytes)
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    start: usize,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder rejecting frames above `max_frame_size` bytes.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            start: 0,
            max_frame_size,
        }
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start * 2 >= self.buffer.len() {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.start
    }

    /// Returns the next complete frame body (`[id][payload]`), if any.
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>, FrameError> {
        let pending = &self.buffer[self.start..];
        if pending.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_le_bytes([pending[0], pending[1], pending[2], pending[3]]);
        if (length as usize) < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort(length));
        }
        if length as usize > self.max_frame_size {
            return Err(FrameError::TooLong {
                length,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length as usize;
        if pending.len() < total {
            return Ok(None);
        }

        let body_start = self.start + LENGTH_PREFIX_SIZE;
        self.start += total;
        Ok(Some(&self.buffer[body_start..self.start]))
    }
}
