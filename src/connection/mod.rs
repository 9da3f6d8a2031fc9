//! Connection Handling Module
//!
//! Everything that lives for the duration of one client connection, plus
//! the registry that finds it by descriptor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ConnectionRegistry                         │
//! │        fd ──> Arc<Mutex<Connection>>   (one lock)           │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ lookup(fd)
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Connection                               │
//! │   fd, peer, non-blocking TcpStream                          │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │ Session                                               │  │
//! │  │   state machine, ReceiveBuffer (EMA-sized), outbound  │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Resumable I/O**: partial reads and writes are stored in the state
//!   and resumed on the next readiness event
//! - **Adaptive Buffers**: grow on demand, shrink by moving average
//! - **Statistics**: connection, message, byte and resize counters

pub mod buffer;
pub mod context;
pub mod registry;
pub mod session;
pub mod stats;

// Re-export commonly used types
pub use buffer::{BufferError, ReceiveBuffer, Resize};
pub use context::Connection;
pub use registry::{ConnectionRegistry, RegistryError, Shared};
pub use session::{ConnectionError, ConnectionState, Progress, Session};
pub use stats::ConnectionStats;
