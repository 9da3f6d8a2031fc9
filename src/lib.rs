//! # socketcore - Connection Core for Length-Prefixed TCP Servers
//!
//! socketcore accepts TCP connections, reads length-prefixed messages from
//! non-blocking sockets, hands each complete message to application code,
//! and writes the framed response back. Readiness notification is
//! pluggable; a `mio`-based reactor is included.
//!
//! ## Features
//!
//! - **Resumable I/O**: every partial read or write is remembered in the
//!   connection state and resumed on the next readiness event
//! - **Adaptive Buffers**: a receive buffer grows to the largest message
//!   and shrinks back using an exponential moving average
//! - **Concurrent Registry**: connections are found by descriptor from
//!   any thread
//! - **Optional Handshake**: a fixed byte string can be required before
//!   the first message
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              socketcore                                 │
//! │                                                                         │
//! │  ┌─────────────┐  add   ┌──────────────────────┐                        │
//! │  │  Acceptor   │───────>│  ConnectionRegistry  │                        │
//! │  │  (thread)   │        │  fd -> Connection    │                        │
//! │  └──────┬──────┘        └──────────▲───────────┘                        │
//! │         │ register                 │ lookup(fd)                         │
//! │         ▼                          │                                    │
//! │  ┌─────────────┐ on_ready ┌────────┴─────┐ handle ┌────────────────┐    │
//! │  │   Reactor   │─────────>│  Dispatcher  │───────>│ MessageHandler │    │
//! │  │ (mio::Poll) │<─────────│              │<───────│                │    │
//! │  └─────────────┘  rearm   └──────────────┘        └────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//!
//! Every message in either direction is a little-endian length prefix
//! (4 bytes by default) followed by exactly that many body bytes:
//!
//! ```text
//! 05 00 00 00 68 65 6c 6c 6f      -> "hello"
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use bytes::Bytes;
//! use socketcore::{Server, ServerConfig};
//! use std::os::fd::RawFd;
//!
//! let handler = |_fd: RawFd, message: &[u8]| Some(Bytes::from(message.to_ascii_uppercase()));
//! let handle = Server::new(ServerConfig::default(), handler).start(7000)?;
//!
//! // ... later
//! handle.shutdown()?;
//! # Ok::<(), socketcore::ServerError>(())
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Server, buffer and handshake configuration
//! - [`protocol`]: Length-prefix framing
//! - [`connection`]: Per-connection state machine, buffers and registry
//! - [`reactor`]: Readiness notification and event dispatch
//! - [`server`]: Listening socket, accept thread and shutdown

pub mod config;
pub mod connection;
pub mod protocol;
pub mod reactor;
pub mod server;

// Re-export commonly used types for convenience
pub use config::{BufferConfig, ConfigError, HandshakeConfig, HandshakePolicy, ServerConfig};
pub use connection::{
    Connection, ConnectionError, ConnectionRegistry, ConnectionState, ConnectionStats, Session,
};
pub use protocol::{FrameError, LengthPrefix};
pub use reactor::{Dispatcher, Echo, MessageHandler, PollReactor, Reactor};
pub use server::{Server, ServerError, ServerHandle};

/// The default port socketcore listens on
pub const DEFAULT_PORT: u16 = 7000;

/// The default host socketcore binds to
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Version of socketcore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
