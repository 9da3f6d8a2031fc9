//! Server Lifecycle
//!
//! [`Server`] ties the pieces together: it binds and listens, starts the
//! reactor with a [`Dispatcher`], and spawns the accept thread. The
//! returned [`ServerHandle`] stops all of it again.
//!
//! ## Startup
//!
//! ```text
//!  validate ─> resolve ─> bind ─> listen ─> reactor.initialize ─> spawn acceptor
//! ```
//!
//! A failing step undoes the ones before it, so a failed `start` leaves
//! no socket or thread behind.
//!
//! ## Shutdown
//!
//! 1. set the stop flag and shut down the listener's read half
//! 2. join the accept thread
//! 3. close the listening socket
//! 4. stop the reactor
//! 5. close every connection still in the registry
//!
//! ## Example
//!
//! ```no_run
//! use socketcore::{Echo, Server, ServerConfig};
//!
//! let handle = Server::new(ServerConfig::default(), Echo).start(7000)?;
//! println!("listening on {}", handle.local_addr());
//! handle.shutdown()?;
//! # Ok::<(), socketcore::ServerError>(())
//! ```

mod acceptor;

use crate::config::{ConfigError, ServerConfig};
use crate::connection::{Connection, ConnectionRegistry, ConnectionStats};
use crate::reactor::{Dispatcher, MessageHandler, PollReactor, Reactor};
use acceptor::Acceptor;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long the fallback wake-up connect may take
const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors from starting or stopping a server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),

    #[error("failed to initialize reactor: {0}")]
    ReactorInit(#[source] io::Error),

    #[error("failed to spawn acceptor thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("acceptor thread panicked")]
    AcceptorPanicked,
}

/// An unstarted server.
pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn MessageHandler>,
    reactor: Arc<dyn Reactor>,
    registry: Arc<ConnectionRegistry<Connection>>,
    stats: Arc<ConnectionStats>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server that passes complete messages to `handler`.
    ///
    /// Events are delivered by a [`PollReactor`] unless another reactor is
    /// set with [`Server::with_reactor`].
    pub fn new(config: ServerConfig, handler: impl MessageHandler) -> Self {
        let reactor = PollReactor::new().with_worker_hint(config.worker_threads);
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            reactor: Arc::new(reactor),
            registry: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(ConnectionStats::new()),
        }
    }

    pub fn with_reactor(mut self, reactor: Arc<dyn Reactor>) -> Self {
        self.reactor = reactor;
        self
    }

    /// Binds `host:port`, starts the reactor and the accept thread.
    ///
    /// Port `0` picks an ephemeral port; see [`ServerHandle::local_addr`].
    pub fn start(self, port: u16) -> Result<ServerHandle, ServerError> {
        self.config.validate()?;

        let listener = bind(&self.config.host, port)?;
        listener
            .listen(self.config.backlog)
            .map_err(ServerError::Listen)?;
        let local_addr = listener
            .local_addr()
            .map_err(ServerError::Listen)?
            .as_socket()
            .ok_or_else(|| {
                ServerError::Listen(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "listener has no IP address",
                ))
            })?;
        let listener = Arc::new(listener);

        let dispatcher = Arc::new(Dispatcher::new(
            self.registry,
            self.handler,
            Arc::clone(&self.reactor),
            self.stats,
        ));
        self.reactor
            .initialize(Arc::clone(&dispatcher))
            .map_err(ServerError::ReactorInit)?;

        let stop = Arc::new(AtomicBool::new(false));
        let acceptor = Acceptor::new(
            Arc::clone(&listener),
            Arc::clone(&stop),
            Arc::clone(&self.config),
            Arc::clone(&dispatcher),
        );
        let spawned = thread::Builder::new()
            .name("socketcore-acceptor".to_string())
            .spawn(move || acceptor.run());
        let acceptor = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.reactor.uninitialize();
                return Err(ServerError::Spawn(e));
            }
        };

        info!(
            addr = %local_addr,
            prefix_width = self.config.prefix_width,
            buffer_size = self.config.buffer.default_capacity,
            "Server listening"
        );

        Ok(ServerHandle {
            local_addr,
            listener: Some(listener),
            stop,
            acceptor: Some(acceptor),
            dispatcher,
        })
    }
}

/// Creates a socket for each resolved address until one binds.
fn bind(host: &str, port: u16) -> Result<Socket, ServerError> {
    let display = format!("{}:{}", host, port);
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ServerError::Bind {
            addr: display.clone(),
            source,
        })?;

    let mut last_error = None;
    for addr in addrs {
        match bind_one(addr) {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Bind attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(ServerError::Bind {
        addr: display,
        source: last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no address")
        }),
    })
}

fn bind_one(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// A running server. Dropping it shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    listener: Option<Arc<Socket>>,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("running", &self.acceptor.is_some())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl ServerHandle {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<Connection>> {
        self.dispatcher.registry()
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        self.dispatcher.stats()
    }

    /// Stops accepting, stops the reactor and closes every connection.
    pub fn shutdown(mut self) -> Result<(), ServerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ServerError> {
        let Some(acceptor) = self.acceptor.take() else {
            return Ok(());
        };

        info!(addr = %self.local_addr, "Shutting down server");
        self.stop.store(true, Ordering::Release);

        if let Some(listener) = &self.listener {
            if let Err(e) = listener.shutdown(Shutdown::Read) {
                debug!(error = %e, "Listener shutdown failed, waking acceptor");
                wake(self.local_addr);
            }
        }

        let joined = acceptor.join();

        // Closes the listening socket; the acceptor held the only other handle
        self.listener = None;

        self.dispatcher.reactor().uninitialize();
        let closed = self.dispatcher.close_all();

        info!(closed, "Server stopped");
        joined.map_err(|_| ServerError::AcceptorPanicked)
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Server shutdown failed");
        }
    }
}

/// Connects to the listener so a blocked `accept` returns.
fn wake(addr: SocketAddr) {
    let target = match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), v4.port())
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), v6.port())
        }
        other => other,
    };

    if let Err(e) = TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
        warn!(addr = %target, error = %e, "Failed to wake acceptor");
    }
}
