//! Wire Protocol
//!
//! Messages are framed with a fixed-width length prefix, full-duplex per
//! connection. A connection may first have to send a configured handshake
//! payload, compared verbatim, before framing applies.
//!
//! ```text
//! client                                 server
//!   │  [handshake bytes]  (optional)       │
//!   │ ───────────────────────────────────> │
//!   │  [len][body]                         │
//!   │ ───────────────────────────────────> │
//!   │                         [len][body]  │
//!   │ <─────────────────────────────────── │
//! ```
//!
//! ## Example
//!
//! ```
//! use socketcore::protocol::LengthPrefix;
//! use bytes::BytesMut;
//!
//! let prefix = LengthPrefix::default();
//! let mut wire = BytesMut::new();
//! prefix.encode_frame(b"hello", &mut wire).unwrap();
//!
//! assert_eq!(&wire[..], b"\x05\x00\x00\x00hello");
//! assert_eq!(prefix.decode(&wire), 5);
//! ```

pub mod prefix;

pub use prefix::{FrameError, LengthPrefix, MAX_PREFIX_WIDTH};
