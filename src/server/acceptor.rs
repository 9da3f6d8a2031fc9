//! Accept Loop
//!
//! Runs on its own thread, blocking in `accept` on the listening socket.
//! Every accepted socket is switched to non-blocking mode, wrapped in a
//! [`Connection`], added to the registry and then registered with the
//! reactor.
//!
//! The loop ends when the listening socket's read half is shut down
//! (`accept` fails with `EINVAL`) or when the stop flag is set and the
//! next `accept` returns.

use crate::config::ServerConfig;
use crate::connection::registry::lock;
use crate::connection::{Connection, ConnectionError};
use crate::reactor::Dispatcher;
use socket2::{SockAddr, Socket};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Exponential back-off for accept failures that signal resource
/// exhaustion. Starts at 10 ms and doubles up to 1 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        let initial = Duration::from_millis(10);
        Self {
            initial,
            max: Duration::from_secs(1),
            current: initial,
        }
    }
}

impl Backoff {
    /// Delay to wait now; doubles the next one.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How the loop reacts to a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptFailure {
    /// Retry at once
    Transient,
    /// The listening socket was shut down
    Stop,
    /// Retry after backing off
    Exhausted,
}

pub(crate) fn classify(error: &io::Error) -> AcceptFailure {
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionAborted => {
            AcceptFailure::Transient
        }
        // EINVAL
        ErrorKind::InvalidInput => AcceptFailure::Stop,
        _ => AcceptFailure::Exhausted,
    }
}

/// Owns everything the accept thread needs.
pub(crate) struct Acceptor {
    listener: Arc<Socket>,
    stop: Arc<AtomicBool>,
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
}

impl Acceptor {
    pub(crate) fn new(
        listener: Arc<Socket>,
        stop: Arc<AtomicBool>,
        config: Arc<ServerConfig>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            listener,
            stop,
            config,
            dispatcher,
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Accepts connections until the listening socket is shut down.
    pub(crate) fn run(self) {
        let mut backoff = Backoff::default();

        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    backoff.reset();
                    if self.stopping() {
                        break;
                    }
                    self.admit(socket, addr);
                }
                Err(_) if self.stopping() => break,
                Err(e) => match classify(&e) {
                    AcceptFailure::Transient => {
                        trace!(error = %e, "Transient accept failure");
                    }
                    AcceptFailure::Stop => break,
                    AcceptFailure::Exhausted => {
                        let delay = backoff.next_delay();
                        warn!(
                            error = %e,
                            retry_ms = delay.as_millis() as u64,
                            "Failed to accept connection"
                        );
                        thread::sleep(delay);
                    }
                },
            }
        }

        info!("Accept loop stopped");
    }

    /// Allocates, registers and arms a freshly accepted socket.
    fn admit(&self, socket: Socket, addr: SockAddr) {
        let Some(peer) = addr.as_socket() else {
            warn!("Accepted a non-IP socket");
            return;
        };

        if let Err(e) = socket.set_nonblocking(true) {
            warn!(peer = %peer, error = %e, "Failed to make socket non-blocking");
            return;
        }

        let stream = mio::net::TcpStream::from_std(socket.into());
        let conn = match Connection::allocate(
            stream,
            peer,
            Arc::clone(&self.config),
            Arc::clone(self.dispatcher.stats()),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to allocate connection");
                return;
            }
        };

        let fd = conn.fd();
        let shared = match self.dispatcher.registry().add(fd, conn) {
            Ok(shared) => shared,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to register connection");
                return;
            }
        };

        let mut conn = lock(&shared);
        self.dispatcher.stats().connection_opened();
        if let Err(e) = self.dispatcher.reactor().register(&mut conn) {
            debug!(fd, error = %e, "Reactor registration failed");
            self.dispatcher.close(&mut conn, ConnectionError::Io(e));
            return;
        }

        info!(fd, peer = %peer, "Client connected");
    }
}
