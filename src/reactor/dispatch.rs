//! Event Dispatch
//!
//! The [`Dispatcher`] is what a reactor calls for every readiness event.
//! It looks the descriptor up in the registry, drives the connection's
//! state machine as far as the socket allows, and owns the close
//! procedure.
//!
//! ## Close Ordering
//!
//! 1. remove the descriptor from the registry (late events now miss)
//! 2. deregister it from the reactor
//! 3. shut the socket down and mark the session closed
//! 4. the context is freed when the last handle drops
//!
//! Closing twice is a no-op, so a connection is counted closed once.
//!
//! ## Fairness
//!
//! One event answers at most [`MESSAGES_PER_EVENT`] messages. When the
//! budget runs out the descriptor is re-armed and the rest waits for the
//! next event, so a peer that keeps pipelining cannot hold the event
//! thread.
//!
//! Every send re-arms for `READABLE | WRITABLE` before writing. With
//! edge-triggered epoll that re-arm queues a writable edge, so a fully
//! written response is usually followed by one extra event that finds
//! nothing to read.

use crate::connection::registry::lock;
use crate::connection::{
    Connection, ConnectionError, ConnectionRegistry, ConnectionState, ConnectionStats, Progress,
};
use crate::reactor::{MessageHandler, Reactor};
use mio::Interest;
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, debug_span, trace, warn};

/// Messages answered per readiness event before yielding
pub const MESSAGES_PER_EVENT: usize = 32;

/// Routes readiness events to connections.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry<Connection>>,
    handler: Arc<dyn MessageHandler>,
    reactor: Arc<dyn Reactor>,
    stats: Arc<ConnectionStats>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connections", &self.registry.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry<Connection>>,
        handler: Arc<dyn MessageHandler>,
        reactor: Arc<dyn Reactor>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            registry,
            handler,
            reactor,
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<Connection>> {
        &self.registry
    }

    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.reactor
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Handles a readiness event for `fd`.
    ///
    /// Events for descriptors no longer in the registry are ignored.
    pub fn on_ready(&self, fd: RawFd) {
        let Some(shared) = self.registry.lookup(fd) else {
            trace!(fd, "Event for unknown descriptor");
            return;
        };

        let mut conn = lock(&shared);
        if conn.session().is_closed() {
            return;
        }

        let _span = debug_span!("connection", fd, peer = %conn.peer()).entered();
        if let Err(e) = self.drive(&mut conn) {
            self.close(&mut conn, e);
        }
    }

    /// Runs receive → handle → send until the socket would block or the
    /// message budget is spent.
    fn drive(&self, conn: &mut Connection) -> Result<(), ConnectionError> {
        let mut handled = 0;
        loop {
            match conn.session().state() {
                ConnectionState::Sending { .. } => {
                    if self.send(conn)? == Progress::Pending {
                        return Ok(());
                    }
                }
                ConnectionState::MessageReady { .. } => {
                    if handled == MESSAGES_PER_EVENT {
                        // The re-arm queues a fresh event for this descriptor
                        trace!(handled, "Message budget spent, yielding");
                        self.reactor
                            .rearm(conn, Interest::READABLE | Interest::WRITABLE)?;
                        return Ok(());
                    }
                    self.dispatch(conn)?;
                    handled += 1;
                }
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                ConnectionState::AwaitingHandshake { .. }
                | ConnectionState::AwaitingPrefix { .. }
                | ConnectionState::AwaitingBody { .. } => {
                    if conn.receive()? == Progress::Pending {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Hands the ready message to the handler and queues its response.
    fn dispatch(&self, conn: &mut Connection) -> Result<(), ConnectionError> {
        let fd = conn.fd();
        let session = conn.session_mut();
        let Some(message) = session.message() else {
            return Err(ConnectionError::NotReady(session.state()));
        };

        match self.handler.handle(fd, message) {
            Some(response) => session.respond(&response),
            None => session.complete().map(|_| ()),
        }
    }

    /// Re-arms the descriptor, then writes the pending response.
    ///
    /// A short write leaves the connection in `Sending`; the next writable
    /// event resumes it.
    pub fn send(&self, conn: &mut Connection) -> Result<Progress, ConnectionError> {
        self.reactor
            .rearm(conn, Interest::READABLE | Interest::WRITABLE)?;

        let progress = conn.write_pending()?;
        if progress == Progress::Pending {
            trace!(remaining = conn.session().remaining(), "Send would block");
        }
        Ok(progress)
    }

    /// Closes a connection and releases its registry entry.
    pub fn close(&self, conn: &mut Connection, reason: ConnectionError) {
        if conn.session().is_closed() {
            return;
        }

        let fd = conn.fd();
        self.registry.remove(fd);
        if let Err(e) = self.reactor.deregister(conn) {
            trace!(fd, error = %e, "Deregister on close failed");
        }
        conn.close();
        self.stats.connection_closed();

        let peer = conn.peer();
        match &reason {
            ConnectionError::PeerClosed | ConnectionError::Shutdown => {
                debug!(fd, peer = %peer, reason = %reason, "Connection closed")
            }
            ConnectionError::Io(e) if e.kind() == ErrorKind::ConnectionReset => {
                debug!(fd, peer = %peer, "Connection reset by client")
            }
            _ => warn!(fd, peer = %peer, error = %reason, "Connection error"),
        }
    }

    /// Closes every registered connection.
    pub fn close_all(&self) -> usize {
        let drained = self.registry.drain();
        let count = drained.len();
        for (_, shared) in drained {
            let mut conn = lock(&shared);
            self.close(&mut conn, ConnectionError::Shutdown);
        }
        count
    }
}
