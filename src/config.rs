//! Server Configuration
//!
//! Every constant the connection core consumes lives here: buffer sizing,
//! the moving-average coefficients that drive adaptive resizing, the wire
//! prefix width and the optional handshake.
//!
//! ## Buffer Sizing
//!
//! After each answered message the running average of body sizes is
//! updated as
//!
//! ```text
//! avg' = max(avg * ema_keep + body_len * ema_sample, default_capacity)
//! ```
//!
//! and the receive buffer shrinks to `avg'` only when
//! `avg' < capacity / shrink_ratio`. A large `ema_keep` means buffers
//! shrink slowly after a burst of big messages.

use bytes::Bytes;
use thiserror::Error;

/// Default receive buffer capacity (8 KB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Default width of the length prefix in bytes
pub const DEFAULT_PREFIX_WIDTH: usize = 4;

/// Largest body accepted by default (64 MB)
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Default listen backlog
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Tolerance used when checking that the EMA coefficients sum to one.
const COEFFICIENT_EPSILON: f64 = 1e-9;

/// Errors reported by [`ServerConfig::validate`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("default buffer capacity must be non-zero")]
    ZeroCapacity,

    #[error("moving-average coefficients must sum to 1 (got {keep} + {sample})")]
    CoefficientSum { keep: f64, sample: f64 },

    #[error("moving-average keep coefficient must be in (0, 1] (got {0})")]
    KeepOutOfRange(f64),

    #[error("shrink ratio must be at least 1 (got {0})")]
    ShrinkRatio(f64),

    #[error("unsupported prefix width: {0} (expected 1, 2, 4 or 8)")]
    PrefixWidth(usize),

    #[error("max message length {max} is below the default buffer capacity {capacity}")]
    MaxMessageLen { max: usize, capacity: usize },

    #[error("handshake payload must not be empty")]
    EmptyHandshake,
}

/// Receive buffer sizing policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    /// Capacity every buffer starts at and never shrinks below
    pub default_capacity: usize,

    /// Weight of the previous average (`a`)
    pub ema_keep: f64,

    /// Weight of the latest body size (`b`)
    pub ema_sample: f64,

    /// Shrink when the average drops below `capacity / shrink_ratio` (`r`)
    pub shrink_ratio: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_BUFFER_CAPACITY,
            ema_keep: 0.9,
            ema_sample: 0.1,
            shrink_ratio: 2.0,
        }
    }
}

/// What to do when a client's handshake bytes differ from the configured payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakePolicy {
    /// Close the connection
    #[default]
    Reject,
    /// Log the mismatch and continue with normal framing
    Ignore,
}

/// Handshake expected before framing starts.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeConfig {
    /// Raw bytes the client must send first, compared verbatim
    pub payload: Bytes,

    /// Behaviour on mismatch
    pub on_mismatch: HandshakePolicy,
}

impl HandshakeConfig {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            on_mismatch: HandshakePolicy::default(),
        }
    }
}

/// Configuration for the connection core.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Listen backlog
    pub backlog: i32,

    /// Receive buffer sizing policy
    pub buffer: BufferConfig,

    /// Width of the little-endian length prefix (1, 2, 4 or 8)
    pub prefix_width: usize,

    /// Bodies longer than this close the connection
    pub max_message_len: usize,

    /// Handshake required before framing, if any
    pub handshake: Option<HandshakeConfig>,

    /// Concurrency hint handed to the reactor
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            backlog: DEFAULT_BACKLOG,
            buffer: BufferConfig::default(),
            prefix_width: DEFAULT_PREFIX_WIDTH,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            handshake: None,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl ServerConfig {
    /// Checks the invariants the buffer and framing code rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let buffer = &self.buffer;

        if buffer.default_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if !(buffer.ema_keep > 0.0 && buffer.ema_keep <= 1.0) {
            return Err(ConfigError::KeepOutOfRange(buffer.ema_keep));
        }
        if ((buffer.ema_keep + buffer.ema_sample) - 1.0).abs() > COEFFICIENT_EPSILON {
            return Err(ConfigError::CoefficientSum {
                keep: buffer.ema_keep,
                sample: buffer.ema_sample,
            });
        }
        // NaN fails this comparison too
        if !(buffer.shrink_ratio >= 1.0) {
            return Err(ConfigError::ShrinkRatio(buffer.shrink_ratio));
        }
        if !matches!(self.prefix_width, 1 | 2 | 4 | 8) {
            return Err(ConfigError::PrefixWidth(self.prefix_width));
        }
        if self.max_message_len < buffer.default_capacity {
            return Err(ConfigError::MaxMessageLen {
                max: self.max_message_len,
                capacity: buffer.default_capacity,
            });
        }
        if let Some(handshake) = &self.handshake {
            if handshake.payload.is_empty() {
                return Err(ConfigError::EmptyHandshake);
            }
        }

        Ok(())
    }
}
