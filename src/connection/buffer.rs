//! Adaptive Receive Buffer
//!
//! Each connection owns one receive buffer. It grows immediately when a
//! message larger than its capacity arrives and shrinks only after the
//! running average of body sizes shows that smaller messages dominate:
//!
//! ```text
//!   capacity
//!      │        ┌──── grow on demand (one reallocation, exact size)
//!      │   ┌────┘
//!      │   │    └─────────┐  shrink once avg < capacity / r
//!      │───┘              └──────────
//!      └──────────────────────────────> messages
//! ```
//!
//! This keeps allocation cost low for bursty, long-lived connections
//! without letting a single outlier pin a large buffer forever.

use crate::config::BufferConfig;
use thiserror::Error;

/// Errors raised by buffer reallocation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BufferError {
    #[error("failed to allocate a {requested}-byte receive buffer")]
    Allocation { requested: usize },
}

/// Outcome of a sizing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resize {
    Unchanged,
    Grew { from: usize, to: usize },
    Shrunk { from: usize, to: usize },
}

/// An owned receive buffer with an explicit capacity and running average.
///
/// The backing storage is always fully initialized, so `capacity()` bytes
/// can be handed to `read` at any time.
#[derive(Debug)]
pub struct ReceiveBuffer {
    /// Backing storage; its length is the capacity
    data: Vec<u8>,

    /// Exponential moving average of recent body sizes
    average: usize,
}

fn allocate(len: usize) -> Result<Vec<u8>, BufferError> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| BufferError::Allocation { requested: len })?;
    data.resize(len, 0);
    Ok(data)
}

impl ReceiveBuffer {
    /// Allocates a buffer of `default_capacity` bytes with the average set
    /// to the same value.
    pub fn new(default_capacity: usize) -> Result<Self, BufferError> {
        Ok(Self {
            data: allocate(default_capacity)?,
            average: default_capacity,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn average(&self) -> usize {
        self.average
    }

    /// The first `len` bytes of the buffer.
    #[inline]
    pub fn filled(&self, len: usize) -> &[u8] {
        &self.data[..len]
    }

    /// Writable window `[from, to)` for the next read.
    #[inline]
    pub(crate) fn window_mut(&mut self, from: usize, to: usize) -> &mut [u8] {
        &mut self.data[from..to]
    }

    /// Makes room for a body of `len` bytes.
    ///
    /// If `len` exceeds the capacity the buffer is replaced by one of
    /// exactly `len` bytes. Existing contents are not preserved. On
    /// allocation failure the current buffer is kept.
    pub fn ensure(&mut self, len: usize) -> Result<Resize, BufferError> {
        let from = self.capacity();
        if len <= from {
            return Ok(Resize::Unchanged);
        }

        self.data = allocate(len)?;
        Ok(Resize::Grew { from, to: len })
    }

    /// Folds the last body size into the running average and shrinks the
    /// buffer if the average has fallen below `capacity / shrink_ratio`.
    pub fn settle(&mut self, last_body_len: usize, policy: &BufferConfig) -> Resize {
        let average = self.average as f64 * policy.ema_keep
            + last_body_len as f64 * policy.ema_sample;
        self.average = (average as usize).max(policy.default_capacity);

        let from = self.capacity();
        if (self.average as f64) >= from as f64 / policy.shrink_ratio {
            return Resize::Unchanged;
        }

        match allocate(self.average) {
            Ok(data) => {
                self.data = data;
                Resize::Shrunk {
                    from,
                    to: self.average,
                }
            }
            // A failed shrink is harmless: the larger buffer stays in use
            Err(_) => Resize::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(default_capacity: usize) -> BufferConfig {
        BufferConfig {
            default_capacity,
            ema_keep: 0.75,
            ema_sample: 0.25,
            shrink_ratio: 2.0,
        }
    }

    #[test]
    fn test_new_buffer() {
        let buf = ReceiveBuffer::new(1024).unwrap();
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(buf.average(), 1024);
    }

    #[test]
    fn test_ensure_within_capacity_is_noop() {
        let mut buf = ReceiveBuffer::new(1024).unwrap();
        assert_eq!(buf.ensure(1024).unwrap(), Resize::Unchanged);
        assert_eq!(buf.ensure(10).unwrap(), Resize::Unchanged);
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn test_ensure_grows_to_exact_length() {
        let mut buf = ReceiveBuffer::new(1024).unwrap();
        assert_eq!(
            buf.ensure(5000).unwrap(),
            Resize::Grew {
                from: 1024,
                to: 5000
            }
        );
        assert_eq!(buf.capacity(), 5000);
        assert_eq!(buf.ensure(5000).unwrap(), Resize::Unchanged);
    }

    #[test]
    fn test_ensure_allocation_failure_keeps_buffer() {
        let mut buf = ReceiveBuffer::new(64).unwrap();
        let result = buf.ensure(usize::MAX);

        assert_eq!(
            result,
            Err(BufferError::Allocation {
                requested: usize::MAX
            })
        );
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_average_follows_recurrence() {
        let policy = policy(100);
        let mut buf = ReceiveBuffer::new(100).unwrap();
        buf.ensure(10_000).unwrap();

        let mut expected = 100usize;
        for size in [10_000, 8_000, 4_000, 50, 50, 50, 50, 50] {
            buf.settle(size, &policy);
            expected = ((expected as f64 * 0.75 + size as f64 * 0.25) as usize).max(100);
            assert_eq!(buf.average(), expected);
        }
    }

    #[test]
    fn test_average_never_below_default() {
        let policy = policy(512);
        let mut buf = ReceiveBuffer::new(512).unwrap();

        for _ in 0..20 {
            buf.settle(0, &policy);
            assert_eq!(buf.average(), 512);
            assert_eq!(buf.capacity(), 512);
        }
    }

    #[test]
    fn test_shrink_iff_average_below_capacity_over_ratio() {
        let policy = policy(100);
        let mut buf = ReceiveBuffer::new(100).unwrap();
        buf.ensure(1000).unwrap();

        // 100 * 0.75 + 1000 * 0.25 = 325, not below 1000 / 2
        assert_eq!(buf.settle(1000, &policy), Resize::Unchanged);
        assert_eq!(buf.average(), 325);

        // 325 * 0.75 + 0 = 243, below 500
        assert_eq!(
            buf.settle(0, &policy),
            Resize::Shrunk { from: 1000, to: 243 }
        );
        assert_eq!(buf.capacity(), 243);
    }

    #[test]
    fn test_single_outlier_does_not_shrink_immediately() {
        let policy = policy(100);
        let mut buf = ReceiveBuffer::new(100).unwrap();
        buf.ensure(400).unwrap();

        // 100 * 0.75 + 400 * 0.25 = 175, not below 400 / 2
        assert_eq!(buf.settle(400, &policy), Resize::Unchanged);
        assert_eq!(buf.capacity(), 400);

        // 175 * 0.75 + 10 * 0.25 = 133, below 200
        assert_eq!(
            buf.settle(10, &policy),
            Resize::Shrunk { from: 400, to: 133 }
        );
    }
}
