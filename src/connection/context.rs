//! Connection Context
//!
//! A [`Connection`] owns one accepted, non-blocking socket together with
//! its [`Session`]. It is created by the acceptor, stored in the registry,
//! mutated in place by the dispatcher on every readiness event, and freed
//! when the last handle is dropped after [`close`](Connection::close).

use crate::config::ServerConfig;
use crate::connection::session::{ConnectionError, Progress, Session};
use crate::connection::stats::ConnectionStats;
use mio::net::TcpStream;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::trace;

/// Per-connection state: the socket, its descriptor and its protocol session.
#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    stream: TcpStream,
    session: Session,
}

impl Connection {
    /// Allocates the context for a freshly accepted stream.
    ///
    /// The receive buffer starts at the configured default capacity and the
    /// handshake is armed if one is configured.
    pub fn allocate(
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<ServerConfig>,
        stats: Arc<ConnectionStats>,
    ) -> Result<Self, ConnectionError> {
        let session = Session::new(config, stats)?;
        Ok(Self {
            fd: stream.as_raw_fd(),
            peer,
            stream,
            session,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// The socket, for reactor registration.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Runs the receive pipeline on the socket.
    pub fn receive(&mut self) -> Result<Progress, ConnectionError> {
        self.session.receive(&mut self.stream)
    }

    /// Writes as much of the pending response as the socket accepts.
    pub fn write_pending(&mut self) -> Result<Progress, ConnectionError> {
        self.session.send(&mut self.stream)
    }

    /// Shuts the socket down and marks the session closed.
    ///
    /// The descriptor itself is released when the context is dropped.
    /// Calling this more than once is harmless.
    pub fn close(&mut self) {
        if self.session.is_closed() {
            return;
        }
        self.session.close();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!(fd = self.fd, error = %e, "Shutdown on close failed");
        }
    }
}
