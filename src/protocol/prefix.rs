//! Length Prefix Codec
//!
//! Every message on the wire is a fixed-width, little-endian, unsigned
//! length followed by exactly that many body bytes:
//!
//! ```text
//! ┌──────────────────────┬───────────────────────────────┐
//! │ length (width bytes) │ body (length bytes)           │
//! └──────────────────────┴───────────────────────────────┘
//! ```
//!
//! There are no delimiters; the prefix is the only source of truth for the
//! body length.

use crate::config::ConfigError;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Widest prefix supported (a `u64`)
pub const MAX_PREFIX_WIDTH: usize = 8;

/// Errors raised while encoding a frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    /// The body does not fit in the prefix
    #[error("body of {len} bytes does not fit a {width}-byte length prefix")]
    BodyTooLong { len: usize, width: usize },
}

/// A fixed-width length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefix {
    width: usize,
}

impl LengthPrefix {
    /// Creates a prefix of `width` bytes (1, 2, 4 or 8).
    pub fn new(width: usize) -> Result<Self, ConfigError> {
        match width {
            1 | 2 | 4 | 8 => Ok(Self { width }),
            _ => Err(ConfigError::PrefixWidth(width)),
        }
    }

    /// Number of bytes the prefix occupies on the wire.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Largest body length this prefix can describe.
    pub fn max_len(&self) -> u64 {
        if self.width == MAX_PREFIX_WIDTH {
            u64::MAX
        } else {
            (1u64 << (self.width * 8)) - 1
        }
    }

    /// Decodes a body length from the first `width` bytes of `src`.
    ///
    /// # Panics
    ///
    /// Panics if `src` is shorter than the prefix width.
    #[inline]
    pub fn decode(&self, mut src: &[u8]) -> u64 {
        src.get_uint_le(self.width)
    }

    /// Appends the prefix for a body of `len` bytes to `dst`.
    pub fn encode(&self, len: usize, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len64 = len as u64;
        if len64 > self.max_len() {
            return Err(FrameError::BodyTooLong {
                len,
                width: self.width,
            });
        }
        dst.put_uint_le(len64, self.width);
        Ok(())
    }

    /// Appends a complete frame (prefix and body) to `dst`.
    pub fn encode_frame(&self, body: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.reserve(self.width + body.len());
        self.encode(body.len(), dst)?;
        dst.put_slice(body);
        Ok(())
    }
}

impl Default for LengthPrefix {
    fn default() -> Self {
        Self {
            width: crate::config::DEFAULT_PREFIX_WIDTH,
        }
    }
}
