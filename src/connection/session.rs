//! Per-Connection Protocol State
//!
//! A [`Session`] holds everything a connection needs between readiness
//! events: the receive buffer, the partially read prefix, the pending
//! response, and an explicit state telling where to resume.
//!
//! ## State Machine
//!
//! ```text
//!  AwaitingHandshake ──┐ (only when a handshake is configured)
//!                      ▼
//!  ┌──────────> AwaitingPrefix { read }
//!  │                   │ prefix complete
//!  │                   ▼
//!  │            AwaitingBody { len, read }
//!  │                   │ body complete
//!  │                   ▼
//!  │            MessageReady { len }
//!  │                   │ respond()
//!  │                   ▼
//!  └─────────── Sending { written }
//!
//!  any state ──> Closed (terminal)
//! ```
//!
//! ## Partial I/O
//!
//! The socket is non-blocking, so every read or write may be short. Only a
//! strictly positive count advances a state's counter. `WouldBlock`
//! returns [`Progress::Pending`] with the partial count stored in the
//! state, handing control back to the reactor. `Interrupted` is retried at
//! once. A zero-length read or any other error fails the connection.
//!
//! The pipelines are generic over [`Read`]/[`Write`], so the same code
//! drives a real socket and the scripted streams used in tests.

use crate::config::{ConfigError, HandshakePolicy, ServerConfig};
use crate::connection::buffer::{BufferError, ReceiveBuffer, Resize};
use crate::connection::stats::ConnectionStats;
use crate::protocol::{FrameError, LengthPrefix, MAX_PREFIX_WIDTH};
use bytes::BytesMut;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Where a connection is in its message cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading the configured handshake payload
    AwaitingHandshake { read: usize },
    /// Reading the length prefix
    AwaitingPrefix { read: usize },
    /// Reading a body of `len` bytes
    AwaitingBody { len: usize, read: usize },
    /// A complete body of `len` bytes sits in the receive buffer
    MessageReady { len: usize },
    /// Writing the response
    Sending { written: usize },
    /// Terminal
    Closed,
}

/// Result of driving a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The socket would block; resume on the next readiness event
    Pending,
    /// The message is ready (receive) or the response is written (send)
    Complete,
}

/// Errors that close a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer closed its side (zero-length read)
    #[error("peer closed the connection")]
    PeerClosed,

    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The length prefix announced a body above the configured limit
    #[error("message too large: {len} bytes (max: {max})")]
    MessageTooLarge { len: u64, max: usize },

    /// Buffer allocation failed
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// The response could not be framed
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Invalid protocol settings
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The handshake bytes did not match and the policy is to reject
    #[error("handshake rejected")]
    HandshakeRejected,

    /// An operation was attempted in the wrong state
    #[error("no message is ready to answer (state: {0:?})")]
    NotReady(ConnectionState),

    /// The connection was already closed
    #[error("connection closed")]
    Closed,

    /// The server is shutting down
    #[error("server shutting down")]
    Shutdown,
}

/// Protocol state of one connection.
#[derive(Debug)]
pub struct Session {
    config: Arc<ServerConfig>,
    prefix: LengthPrefix,
    state: ConnectionState,

    /// Partially read length prefix
    header: [u8; MAX_PREFIX_WIDTH],

    /// Handshake bytes read so far; released once the handshake is done
    handshake: Vec<u8>,

    buffer: ReceiveBuffer,

    /// Body length of the most recently completed message
    message_len: usize,

    /// Framed response being written
    outbound: BytesMut,

    stats: Arc<ConnectionStats>,
}

impl Session {
    /// Allocates the receive buffer at the configured default capacity and
    /// arms the handshake if one is configured.
    pub fn new(
        config: Arc<ServerConfig>,
        stats: Arc<ConnectionStats>,
    ) -> Result<Self, ConnectionError> {
        let prefix = LengthPrefix::new(config.prefix_width)?;
        let buffer = ReceiveBuffer::new(config.buffer.default_capacity)?;

        let handshake_len = config
            .handshake
            .as_ref()
            .map(|h| h.payload.len())
            .unwrap_or(0);
        let state = if handshake_len > 0 {
            ConnectionState::AwaitingHandshake { read: 0 }
        } else {
            ConnectionState::AwaitingPrefix { read: 0 }
        };

        Ok(Self {
            config,
            prefix,
            state,
            header: [0; MAX_PREFIX_WIDTH],
            handshake: vec![0; handshake_len],
            buffer,
            message_len: 0,
            outbound: BytesMut::new(),
            stats,
        })
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Whether the handshake payload is still expected.
    pub fn awaiting_handshake(&self) -> bool {
        matches!(self.state, ConnectionState::AwaitingHandshake { .. })
    }

    pub fn buffer(&self) -> &ReceiveBuffer {
        &self.buffer
    }

    /// Body length of the most recently completed message.
    pub fn message_len(&self) -> usize {
        self.message_len
    }

    /// The completed body, while the message is ready to be answered.
    pub fn message(&self) -> Option<&[u8]> {
        match self.state {
            ConnectionState::MessageReady { len } => Some(self.buffer.filled(len)),
            _ => None,
        }
    }

    /// Bytes of the current response not yet written.
    pub fn remaining(&self) -> usize {
        match self.state {
            ConnectionState::Sending { written } => self.outbound.len() - written,
            _ => 0,
        }
    }

    /// Reads until one complete message is assembled or the socket would block.
    ///
    /// Once a message is ready nothing more is read until it has been
    /// answered with [`respond`](Self::respond) and [`send`](Self::send), or
    /// released with [`complete`](Self::complete).
    pub fn receive<R: Read>(&mut self, src: &mut R) -> Result<Progress, ConnectionError> {
        loop {
            match self.state {
                ConnectionState::AwaitingHandshake { read } => {
                    let Some(n) = read_some(src, &mut self.handshake[read..])? else {
                        return Ok(Progress::Pending);
                    };
                    self.stats.bytes_read(n);

                    let read = read + n;
                    if read < self.handshake.len() {
                        self.state = ConnectionState::AwaitingHandshake { read };
                    } else {
                        self.finish_handshake()?;
                    }
                }
                ConnectionState::AwaitingPrefix { read } => {
                    let width = self.prefix.width();
                    let Some(n) = read_some(src, &mut self.header[read..width])? else {
                        return Ok(Progress::Pending);
                    };
                    self.stats.bytes_read(n);

                    let read = read + n;
                    if read < width {
                        self.state = ConnectionState::AwaitingPrefix { read };
                    } else {
                        let len = self.prefix.decode(&self.header[..width]);
                        self.begin_body(len)?;
                    }
                }
                ConnectionState::AwaitingBody { len, read } => {
                    let Some(n) = read_some(src, self.buffer.window_mut(read, len))? else {
                        return Ok(Progress::Pending);
                    };
                    self.stats.bytes_read(n);

                    let read = read + n;
                    trace!(read, len, "Body progress");
                    if read < len {
                        self.state = ConnectionState::AwaitingBody { len, read };
                    } else {
                        self.message_ready(len);
                    }
                }
                ConnectionState::MessageReady { .. } | ConnectionState::Sending { .. } => {
                    return Ok(Progress::Complete);
                }
                ConnectionState::Closed => return Err(ConnectionError::Closed),
            }
        }
    }

    /// Frames `body` as the response to the ready message.
    pub fn respond(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        if !matches!(self.state, ConnectionState::MessageReady { .. }) {
            return Err(ConnectionError::NotReady(self.state));
        }

        self.outbound.clear();
        self.prefix.encode_frame(body, &mut self.outbound)?;
        self.state = ConnectionState::Sending { written: 0 };
        Ok(())
    }

    /// Releases the ready message without sending a response.
    pub fn complete(&mut self) -> Result<Resize, ConnectionError> {
        if !matches!(self.state, ConnectionState::MessageReady { .. }) {
            return Err(ConnectionError::NotReady(self.state));
        }
        Ok(self.reset())
    }

    /// Writes the pending response until done or the socket would block.
    ///
    /// When the response is fully written the session is reset for the
    /// next message. Outside of `Sending` there is nothing to write and
    /// this returns [`Progress::Complete`].
    pub fn send<W: Write>(&mut self, dst: &mut W) -> Result<Progress, ConnectionError> {
        let mut written = match self.state {
            ConnectionState::Sending { written } => written,
            ConnectionState::Closed => return Err(ConnectionError::Closed),
            _ => return Ok(Progress::Complete),
        };

        while written < self.outbound.len() {
            match dst.write(&self.outbound[written..]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => {
                    written += n;
                    self.stats.bytes_written(n);
                    trace!(written, total = self.outbound.len(), "Write progress");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.state = ConnectionState::Sending { written };
                    return Ok(Progress::Pending);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.stats.message_sent();
        self.reset();
        Ok(Progress::Complete)
    }

    /// Marks the session closed and drops the pending response.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.outbound = BytesMut::new();
    }

    fn finish_handshake(&mut self) -> Result<(), ConnectionError> {
        let Some(expected) = self.config.handshake.as_ref() else {
            return Err(ConnectionError::NotReady(self.state));
        };

        if self.handshake[..] != expected.payload[..] {
            self.stats.handshake_failed();
            match expected.on_mismatch {
                HandshakePolicy::Reject => return Err(ConnectionError::HandshakeRejected),
                HandshakePolicy::Ignore => {
                    warn!(len = self.handshake.len(), "Handshake mismatch ignored")
                }
            }
        } else {
            debug!("Handshake accepted");
        }

        self.handshake = Vec::new();
        self.state = ConnectionState::AwaitingPrefix { read: 0 };
        Ok(())
    }

    fn begin_body(&mut self, len: u64) -> Result<(), ConnectionError> {
        let max = self.config.max_message_len;
        if len > max as u64 {
            return Err(ConnectionError::MessageTooLarge { len, max });
        }

        let len = len as usize;
        if len == 0 {
            self.message_ready(0);
            return Ok(());
        }

        if let Resize::Grew { from, to } = self.buffer.ensure(len)? {
            self.stats.buffer_grew();
            debug!(from, to, "Receive buffer grown");
        }
        self.state = ConnectionState::AwaitingBody { len, read: 0 };
        Ok(())
    }

    fn message_ready(&mut self, len: usize) {
        self.message_len = len;
        self.state = ConnectionState::MessageReady { len };
        self.stats.message_received();
        trace!(len, "Message ready");
    }

    fn reset(&mut self) -> Resize {
        self.outbound = BytesMut::new();

        let resize = self.buffer.settle(self.message_len, &self.config.buffer);
        if let Resize::Shrunk { from, to } = resize {
            self.stats.buffer_shrunk();
            debug!(from, to, average = self.buffer.average(), "Receive buffer shrunk");
        }

        self.state = ConnectionState::AwaitingPrefix { read: 0 };
        resize
    }
}

/// One read with the accumulate policy: `None` means would-block.
fn read_some<R: Read>(src: &mut R, dst: &mut [u8]) -> Result<Option<usize>, ConnectionError> {
    loop {
        match src.read(dst) {
            Ok(0) => return Err(ConnectionError::PeerClosed),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ConnectionError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, HandshakeConfig};
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;

    /// One scripted result of a `read` or `write` call.
    #[derive(Debug, Clone)]
    enum Step {
        Data(Vec<u8>),
        Accept(usize),
        WouldBlock,
        Interrupted,
        Eof,
        Fail,
    }

    /// A stream that replays a script; an exhausted script would block.
    #[derive(Debug, Default)]
    struct ScriptedStream {
        reads: VecDeque<Step>,
        writes: VecDeque<Step>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn reading(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                reads: steps.into_iter().collect(),
                ..Default::default()
            }
        }

        fn writing(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                writes: steps.into_iter().collect(),
                ..Default::default()
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Step::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(Step::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
                Some(Step::Interrupted) => Err(ErrorKind::Interrupted.into()),
                Some(Step::Eof) => Ok(0),
                Some(Step::Fail) => Err(ErrorKind::ConnectionReset.into()),
                Some(Step::WouldBlock) | Some(Step::Accept(_)) | None => {
                    Err(ErrorKind::WouldBlock.into())
                }
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.writes.pop_front() {
                Some(Step::Accept(n)) => {
                    let n = n.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(Step::WouldBlock) => Err(ErrorKind::WouldBlock.into()),
                Some(Step::Interrupted) => Err(ErrorKind::Interrupted.into()),
                Some(Step::Eof) => Ok(0),
                Some(Step::Fail) => Err(ErrorKind::BrokenPipe.into()),
                Some(Step::Data(_)) | None => {
                    self.written.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        LengthPrefix::default().encode_frame(body, &mut wire).unwrap();
        wire.to_vec()
    }

    fn session_with(config: ServerConfig) -> (Session, Arc<ConnectionStats>) {
        let stats = Arc::new(ConnectionStats::new());
        let session = Session::new(Arc::new(config), Arc::clone(&stats)).unwrap();
        (session, stats)
    }

    fn session() -> (Session, Arc<ConnectionStats>) {
        session_with(ServerConfig::default())
    }

    /// Calls `receive` until it completes, with a bound on the number of calls.
    fn receive_all(session: &mut Session, stream: &mut ScriptedStream) -> Progress {
        for _ in 0..10_000 {
            if session.receive(stream).unwrap() == Progress::Complete {
                return Progress::Complete;
            }
        }
        Progress::Pending
    }

    #[test]
    fn test_hello_round_trip() {
        let (mut session, stats) = session();
        let mut stream = ScriptedStream::reading([Step::Data(frame(b"hello"))]);

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Complete);
        assert_eq!(session.state(), ConnectionState::MessageReady { len: 5 });
        assert_eq!(session.message(), Some(&b"hello"[..]));
        assert_eq!(session.message_len(), 5);
        assert_eq!(stats.messages_received.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_would_block_during_prefix_keeps_count() {
        let (mut session, _) = session();
        let wire = frame(b"hello");
        let mut stream = ScriptedStream::reading([
            Step::Data(wire[..1].to_vec()),
            Step::WouldBlock,
            Step::Data(wire[1..3].to_vec()),
            Step::WouldBlock,
            Step::Interrupted,
            Step::Data(wire[3..].to_vec()),
        ]);

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Pending);
        assert_eq!(session.state(), ConnectionState::AwaitingPrefix { read: 1 });

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Pending);
        assert_eq!(session.state(), ConnectionState::AwaitingPrefix { read: 3 });

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Complete);
        assert_eq!(session.message(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_would_block_during_body_keeps_count() {
        let (mut session, _) = session();
        let wire = frame(b"hello world");
        let mut stream = ScriptedStream::reading([
            Step::Data(wire[..6].to_vec()),
            Step::WouldBlock,
            Step::Data(wire[6..].to_vec()),
        ]);

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Pending);
        assert_eq!(
            session.state(),
            ConnectionState::AwaitingBody { len: 11, read: 2 }
        );
        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Complete);
        assert_eq!(session.message(), Some(&b"hello world"[..]));
    }

    #[test]
    fn test_zero_read_in_prefix_closes() {
        let (mut session, _) = session();
        let mut stream = ScriptedStream::reading([Step::Data(vec![5, 0]), Step::Eof]);

        assert!(matches!(
            session.receive(&mut stream),
            Err(ConnectionError::PeerClosed)
        ));
    }

    #[test]
    fn test_zero_read_in_body_closes() {
        let (mut session, _) = session();
        let mut stream =
            ScriptedStream::reading([Step::Data(frame(b"hello")[..6].to_vec()), Step::Eof]);

        assert!(matches!(
            session.receive(&mut stream),
            Err(ConnectionError::PeerClosed)
        ));
    }

    #[test]
    fn test_read_error_closes() {
        let (mut session, _) = session();
        let mut stream = ScriptedStream::reading([Step::Fail]);

        assert!(matches!(
            session.receive(&mut stream),
            Err(ConnectionError::Io(e)) if e.kind() == ErrorKind::ConnectionReset
        ));
    }

    #[test]
    fn test_zero_length_body() {
        let (mut session, _) = session();
        let mut stream = ScriptedStream::reading([Step::Data(frame(b""))]);

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Complete);
        assert_eq!(session.message(), Some(&b""[..]));
    }

    #[test]
    fn test_oversized_body_grows_exactly_once() {
        let config = ServerConfig {
            buffer: BufferConfig {
                default_capacity: 16,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut session, stats) = session_with(config);
        let body = vec![7u8; 100];
        let wire = frame(&body);
        let mut stream = ScriptedStream::reading([
            Step::Data(wire[..4].to_vec()),
            Step::WouldBlock,
            Step::Data(wire[4..50].to_vec()),
            Step::WouldBlock,
            Step::Data(wire[50..].to_vec()),
        ]);

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Pending);
        // grown before any body byte was accepted
        assert_eq!(session.buffer().capacity(), 100);
        assert_eq!(stats.buffer_grows.load(Ordering::Relaxed), 1);

        assert_eq!(receive_all(&mut session, &mut stream), Progress::Complete);
        assert_eq!(session.message(), Some(&body[..]));
        assert_eq!(stats.buffer_grows.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_message_too_large_closes() {
        let config = ServerConfig {
            buffer: BufferConfig {
                default_capacity: 16,
                ..Default::default()
            },
            max_message_len: 32,
            ..Default::default()
        };
        let (mut session, _) = session_with(config);
        let mut stream = ScriptedStream::reading([Step::Data(vec![33, 0, 0, 0])]);

        assert!(matches!(
            session.receive(&mut stream),
            Err(ConnectionError::MessageTooLarge { len: 33, max: 32 })
        ));
    }

    #[test]
    fn test_ready_message_blocks_further_reads() {
        let (mut session, _) = session();
        let mut wire = frame(b"one");
        wire.extend(frame(b"two"));
        let mut stream = ScriptedStream::reading([Step::Data(wire)]);

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Complete);
        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Complete);
        assert_eq!(session.message(), Some(&b"one"[..]));

        session.complete().unwrap();
        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Complete);
        assert_eq!(session.message(), Some(&b"two"[..]));
    }

    #[test]
    fn test_send_handles_short_writes_and_would_block() {
        let (mut session, stats) = session();
        let mut input = ScriptedStream::reading([Step::Data(frame(b"ping"))]);
        session.receive(&mut input).unwrap();
        session.respond(b"pong pong").unwrap();
        assert_eq!(session.remaining(), 13);

        let mut out = ScriptedStream::writing([
            Step::Accept(3),
            Step::Interrupted,
            Step::Accept(2),
            Step::WouldBlock,
        ]);
        assert_eq!(session.send(&mut out).unwrap(), Progress::Pending);
        assert_eq!(session.state(), ConnectionState::Sending { written: 5 });
        assert_eq!(session.remaining(), 8);

        assert_eq!(session.send(&mut out).unwrap(), Progress::Complete);
        assert_eq!(out.written, frame(b"pong pong"));
        assert_eq!(session.state(), ConnectionState::AwaitingPrefix { read: 0 });
        assert_eq!(stats.messages_sent.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 13);
    }

    #[test]
    fn test_write_zero_closes() {
        let (mut session, _) = session();
        let mut input = ScriptedStream::reading([Step::Data(frame(b"ping"))]);
        session.receive(&mut input).unwrap();
        session.respond(b"pong").unwrap();

        let mut out = ScriptedStream::writing([Step::Eof]);
        assert!(matches!(
            session.send(&mut out),
            Err(ConnectionError::Io(e)) if e.kind() == ErrorKind::WriteZero
        ));
    }

    #[test]
    fn test_write_error_closes() {
        let (mut session, _) = session();
        let mut input = ScriptedStream::reading([Step::Data(frame(b"ping"))]);
        session.receive(&mut input).unwrap();
        session.respond(b"pong").unwrap();

        let mut out = ScriptedStream::writing([Step::Accept(1), Step::Fail]);
        assert!(matches!(
            session.send(&mut out),
            Err(ConnectionError::Io(e)) if e.kind() == ErrorKind::BrokenPipe
        ));
    }

    #[test]
    fn test_respond_requires_ready_message() {
        let (mut session, _) = session();
        assert!(matches!(
            session.respond(b"nope"),
            Err(ConnectionError::NotReady(ConnectionState::AwaitingPrefix { read: 0 }))
        ));
        assert!(session.complete().is_err());
    }

    #[test]
    fn test_response_too_long_for_prefix() {
        let config = ServerConfig {
            prefix_width: 1,
            ..Default::default()
        };
        let (mut session, _) = session_with(config);
        let mut input = ScriptedStream::reading([Step::Data(vec![1, b'x'])]);
        session.receive(&mut input).unwrap();

        assert!(matches!(
            session.respond(&[0u8; 300]),
            Err(ConnectionError::Frame(FrameError::BodyTooLong { len: 300, width: 1 }))
        ));
    }

    #[test]
    fn test_reset_shrinks_after_small_messages() {
        let config = ServerConfig {
            buffer: BufferConfig {
                default_capacity: 64,
                ema_keep: 0.5,
                ema_sample: 0.5,
                shrink_ratio: 2.0,
            },
            ..Default::default()
        };
        let (mut session, stats) = session_with(config);

        let mut input = ScriptedStream::reading([Step::Data(frame(&[1u8; 1000]))]);
        session.receive(&mut input).unwrap();
        // avg = 64 * 0.5 + 1000 * 0.5 = 532, not below 1000 / 2
        assert_eq!(session.complete().unwrap(), Resize::Unchanged);
        assert_eq!(session.buffer().capacity(), 1000);

        let mut input = ScriptedStream::reading([Step::Data(frame(b"tiny"))]);
        session.receive(&mut input).unwrap();
        // avg = 532 * 0.5 + 4 * 0.5 = 268, below 500
        assert_eq!(
            session.complete().unwrap(),
            Resize::Shrunk { from: 1000, to: 268 }
        );
        assert_eq!(stats.buffer_shrinks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_handshake_accepted() {
        let config = ServerConfig {
            handshake: Some(HandshakeConfig::new(Bytes::from_static(b"HELO"))),
            ..Default::default()
        };
        let (mut session, stats) = session_with(config);
        assert!(session.awaiting_handshake());

        let rest = [b"LO".to_vec(), frame(b"hi")].concat();
        let mut stream = ScriptedStream::reading([
            Step::Data(b"HE".to_vec()),
            Step::WouldBlock,
            Step::Data(rest),
        ]);

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Pending);
        assert_eq!(
            session.state(),
            ConnectionState::AwaitingHandshake { read: 2 }
        );
        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Complete);
        assert!(!session.awaiting_handshake());
        assert_eq!(session.message(), Some(&b"hi"[..]));
        assert_eq!(stats.handshake_failures.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_handshake_mismatch_rejected() {
        let config = ServerConfig {
            handshake: Some(HandshakeConfig::new(Bytes::from_static(b"HELO"))),
            ..Default::default()
        };
        let (mut session, stats) = session_with(config);
        let mut stream = ScriptedStream::reading([Step::Data(b"NOPE".to_vec())]);

        assert!(matches!(
            session.receive(&mut stream),
            Err(ConnectionError::HandshakeRejected)
        ));
        assert_eq!(stats.handshake_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_handshake_mismatch_ignored() {
        let config = ServerConfig {
            handshake: Some(HandshakeConfig {
                payload: Bytes::from_static(b"HELO"),
                on_mismatch: HandshakePolicy::Ignore,
            }),
            ..Default::default()
        };
        let (mut session, stats) = session_with(config);
        let wire = [b"NOPE".to_vec(), frame(b"still here")].concat();
        let mut stream = ScriptedStream::reading([Step::Data(wire)]);

        assert_eq!(session.receive(&mut stream).unwrap(), Progress::Complete);
        assert_eq!(session.message(), Some(&b"still here"[..]));
        assert_eq!(stats.handshake_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_closed_session_rejects_io() {
        let (mut session, _) = session();
        session.close();

        let mut stream = ScriptedStream::default();
        assert!(matches!(
            session.receive(&mut stream),
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(session.send(&mut stream), Err(ConnectionError::Closed)));
    }

    /// Splits `wire` into chunks of the given sizes, inserting a
    /// would-block or interrupted result after chunks as directed.
    fn fragment(wire: &[u8], cuts: &[(usize, u8)]) -> Vec<Step> {
        let mut steps = Vec::new();
        let mut rest = wire;
        for &(size, pause) in cuts {
            if rest.is_empty() {
                break;
            }
            let n = size.clamp(1, rest.len());
            steps.push(Step::Data(rest[..n].to_vec()));
            rest = &rest[n..];
            match pause % 3 {
                0 => steps.push(Step::WouldBlock),
                1 => steps.push(Step::Interrupted),
                _ => {}
            }
        }
        if !rest.is_empty() {
            steps.push(Step::Data(rest.to_vec()));
        }
        steps
    }

    proptest! {
        #[test]
        fn prop_any_fragmentation_assembles_body(
            body in proptest::collection::vec(any::<u8>(), 0..3000),
            cuts in proptest::collection::vec((1usize..64, any::<u8>()), 0..200),
            width in prop_oneof![Just(1usize), Just(2), Just(4), Just(8)],
        ) {
            let body = if width == 1 { &body[..body.len().min(255)] } else { &body[..] };
            let config = ServerConfig {
                prefix_width: width,
                buffer: BufferConfig { default_capacity: 256, ..Default::default() },
                ..Default::default()
            };
            let (mut session, _) = session_with(config);

            let mut wire = BytesMut::new();
            LengthPrefix::new(width).unwrap().encode_frame(body, &mut wire).unwrap();
            let mut stream = ScriptedStream::reading(fragment(&wire, &cuts));

            prop_assert_eq!(receive_all(&mut session, &mut stream), Progress::Complete);
            prop_assert_eq!(session.message_len(), body.len());
            prop_assert_eq!(session.message(), Some(body));
            prop_assert!(session.buffer().capacity() >= 256);
        }
    }
}
