//! Readiness Notification
//!
//! The connection core does not poll sockets itself. A [`Reactor`]
//! watches descriptors and calls [`Dispatcher::on_ready`] when one becomes
//! readable or writable; the dispatcher then runs the receive pipeline,
//! hands complete messages to the [`MessageHandler`], and runs the send
//! pipeline.
//!
//! ```text
//!  ┌──────────┐ on_ready(fd) ┌────────────┐ handle(body) ┌────────────────┐
//!  │ Reactor  │─────────────>│ Dispatcher │─────────────>│ MessageHandler │
//!  └──────────┘              └─────┬──────┘<─────────────└────────────────┘
//!       ▲  rearm / deregister      │           response
//!       └──────────────────────────┘
//! ```
//!
//! The contract expected of a reactor:
//!
//! - events are edge-triggered hints; the dispatcher always drains until
//!   the socket would block
//! - at most one thread handles a given descriptor's events at a time
//! - [`Reactor::rearm`] on a descriptor that is already ready queues a new
//!   event for it
//! - after [`Reactor::uninitialize`] returns, no further events are
//!   delivered
//!
//! [`PollReactor`] is a single-threaded implementation on `mio`.

pub mod dispatch;
pub mod poll;

pub use dispatch::{Dispatcher, MESSAGES_PER_EVENT};
pub use poll::PollReactor;

use crate::connection::Connection;
use bytes::Bytes;
use mio::Interest;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// A readiness-notification mechanism.
pub trait Reactor: Send + Sync + 'static {
    /// Starts delivering events to `dispatcher`.
    fn initialize(&self, dispatcher: Arc<Dispatcher>) -> io::Result<()>;

    /// Stops delivering events. Idempotent.
    fn uninitialize(&self);

    /// Starts watching a newly accepted connection for readability.
    fn register(&self, conn: &mut Connection) -> io::Result<()>;

    /// Re-arms a connection's descriptor with the given interest.
    fn rearm(&self, conn: &mut Connection, interest: Interest) -> io::Result<()>;

    /// Stops watching a connection.
    fn deregister(&self, conn: &mut Connection) -> io::Result<()>;
}

/// Application logic for complete messages.
///
/// Returning `Some(body)` sends `body` back as one framed response;
/// returning `None` sends nothing and moves on to the next message.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, fd: RawFd, message: &[u8]) -> Option<Bytes>;
}

impl<F> MessageHandler for F
where
    F: Fn(RawFd, &[u8]) -> Option<Bytes> + Send + Sync + 'static,
{
    fn handle(&self, fd: RawFd, message: &[u8]) -> Option<Bytes> {
        self(fd, message)
    }
}

/// Sends every message back unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl MessageHandler for Echo {
    fn handle(&self, _fd: RawFd, message: &[u8]) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(message))
    }
}
