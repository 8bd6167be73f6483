//! Connection state machine.
//!
//! Each connection splits into two halves:
//!
//! - [`Connection`]: owned by exactly one worker event loop. Holds the socket,
//!   the read-framing state, and the write progress for the frame currently
//!   on the wire. Only the owning worker thread ever touches it, which is
//!   what makes the single-flight guarantee structural rather than locked.
//! - [`ConnHandle`]: shared, reference-counted. Carries the outbound queue
//!   and the closed flag, and is what handlers (running on the dispatch
//!   thread) use to send responses or close the connection. The handle stays
//!   alive as long as any dispatch envelope still references it, so a send
//!   path never dangles even after the socket is gone.
//!
//! Read framing cycles `AwaitingHeader` -> `AwaitingBody` -> `AwaitingHeader`
//! until error, EOF, or close. The declared body length is peer-controlled,
//! so it is checked against the configured limit before the body buffer is
//! sized.

use crate::dispatch::{DispatchEnvelope, DispatchHandle, InboundMessage};
use crate::protocol::{self, FrameError, MessageHeader, HEADER_LEN};
use crate::runtime::event_loop::{Command, ContextHandle};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read-framing state. One header+body cycle produces one inbound message.
#[derive(Debug, Clone, Copy)]
enum FrameState {
    /// Accumulating the fixed-size header.
    AwaitingHeader,
    /// Accumulating `body_len` bytes of body for message `msg_id`.
    AwaitingBody { msg_id: u16, body_len: usize },
}

/// Errors returned by [`ConnHandle::send`].
#[derive(Debug)]
pub enum SendError {
    /// The connection is closed or closing; the frame was not queued.
    Closed,
    /// The payload cannot be framed.
    Frame(FrameError),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
            SendError::Frame(e) => write!(f, "frame error: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

/// Shared, thread-safe face of a connection.
pub struct ConnHandle {
    id: u64,
    peer: SocketAddr,
    ctx: ContextHandle,
    outbound: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
}

impl ConnHandle {
    pub(crate) fn new(id: u64, peer: SocketAddr, ctx: ContextHandle) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            ctx,
            outbound: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Unique connection id, assigned at accept time.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address of the accepted socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection has been closed (or is closing).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue one message for transmission.
    ///
    /// The frame is encoded into a single contiguous buffer and appended to
    /// this connection's outbound queue. If the queue was empty, the owning
    /// worker is woken to start writing; otherwise a write is already in
    /// flight and will drain the queue in FIFO order. Frames from concurrent
    /// senders are never interleaved on the wire, and once a frame starts
    /// transmitting it is written to completion before the next one begins.
    pub fn send(&self, msg_id: u16, payload: &[u8]) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let frame = protocol::encode_frame(msg_id, payload).map_err(SendError::Frame)?;

        let was_empty = {
            let mut outbound = self.outbound.lock();
            outbound.push_back(frame);
            outbound.len() == 1
        };

        if was_empty {
            self.ctx
                .send_command(Command::Flush { conn_id: self.id })
                .map_err(|_| SendError::Closed)?;
        }
        Ok(())
    }

    /// Request the connection be closed.
    ///
    /// Idempotent: the first call flips the closed flag and notifies the
    /// owning worker to tear the socket down; subsequent calls are no-ops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.ctx.send_command(Command::Close { conn_id: self.id });
        }
    }

    /// Mark closed without notifying the worker. Used by the worker itself
    /// during teardown, where sending a command would be circular.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn front_frame(&self) -> Option<Bytes> {
        self.outbound.lock().front().cloned()
    }

    pub(crate) fn pop_frame(&self) {
        self.outbound.lock().pop_front();
    }

    pub(crate) fn clear_outbound(&self) {
        self.outbound.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn stub(id: u64, ctx: ContextHandle) -> Arc<Self> {
        Self::new(id, "127.0.0.1:0".parse().expect("literal addr"), ctx)
    }

    #[cfg(test)]
    pub(crate) fn queued_frames(&self) -> usize {
        self.outbound.lock().len()
    }
}

/// Worker-owned half of a connection.
pub(crate) struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) handle: Arc<ConnHandle>,
    state: FrameState,
    header_buf: [u8; HEADER_LEN],
    header_filled: usize,
    body_buf: BytesMut,
    body_filled: usize,
    /// Bytes of the front outbound frame already written to the socket.
    write_pos: usize,
    /// Interest currently registered with the poll.
    interest: Interest,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, handle: Arc<ConnHandle>) -> Self {
        Self {
            stream,
            handle,
            state: FrameState::AwaitingHeader,
            header_buf: [0; HEADER_LEN],
            header_filled: 0,
            body_buf: BytesMut::new(),
            body_filled: 0,
            write_pos: 0,
            interest: Interest::READABLE,
        }
    }

    pub(crate) fn initial_interest(&self) -> Interest {
        self.interest
    }

    /// Advance the framing state machine as far as the socket allows.
    ///
    /// Reads until `WouldBlock` (the poll is edge-triggered), posting one
    /// dispatch envelope per completed header+body cycle. EOF and over-limit
    /// body lengths surface as errors; the caller closes the connection.
    pub(crate) fn handle_readable(
        &mut self,
        dispatch: &DispatchHandle,
        max_body_len: usize,
    ) -> io::Result<()> {
        loop {
            match self.state {
                FrameState::AwaitingHeader => {
                    let n = match self.read_some_header() {
                        Ok(Some(n)) => n,
                        Ok(None) => return Ok(()),
                        Err(e) => return Err(e),
                    };
                    self.header_filled += n;
                    if self.header_filled < HEADER_LEN {
                        continue;
                    }

                    let header = MessageHeader::decode(&self.header_buf);
                    let body_len = header.body_len as usize;
                    if body_len > max_body_len {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("declared body length {body_len} exceeds limit {max_body_len}"),
                        ));
                    }

                    self.header_filled = 0;
                    self.body_buf = BytesMut::zeroed(body_len);
                    self.body_filled = 0;
                    self.state = FrameState::AwaitingBody {
                        msg_id: header.msg_id,
                        body_len,
                    };
                }
                FrameState::AwaitingBody { msg_id, body_len } => {
                    if self.body_filled < body_len {
                        let n = match self.read_some_body(body_len) {
                            Ok(Some(n)) => n,
                            Ok(None) => return Ok(()),
                            Err(e) => return Err(e),
                        };
                        self.body_filled += n;
                        if self.body_filled < body_len {
                            continue;
                        }
                    }

                    // One full header+body cycle: hand the message to the
                    // dispatch queue and start on the next header.
                    let payload = std::mem::take(&mut self.body_buf).freeze();
                    dispatch.post(DispatchEnvelope::new(
                        Arc::clone(&self.handle),
                        InboundMessage { msg_id, payload },
                    ));
                    self.state = FrameState::AwaitingHeader;
                }
            }
        }
    }

    /// Write queued frames until the queue drains or the socket blocks.
    ///
    /// The front frame is written to completion before the next one is
    /// started; `write_pos` carries partial-write progress across calls.
    /// WRITABLE interest is armed only while bytes are pending.
    pub(crate) fn flush(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        loop {
            let Some(frame) = self.handle.front_frame() else {
                self.write_pos = 0;
                return self.set_interest(registry, token, Interest::READABLE);
            };

            match self.stream.write(&frame[self.write_pos..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    ));
                }
                Ok(n) => {
                    self.write_pos += n;
                    if self.write_pos == frame.len() {
                        self.handle.pop_frame();
                        self.write_pos = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.set_interest(
                        registry,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn read_some_header(&mut self) -> io::Result<Option<usize>> {
        read_nonblocking(
            &mut self.stream,
            &mut self.header_buf[self.header_filled..],
        )
    }

    fn read_some_body(&mut self, body_len: usize) -> io::Result<Option<usize>> {
        read_nonblocking(
            &mut self.stream,
            &mut self.body_buf[self.body_filled..body_len],
        )
    }

    fn set_interest(
        &mut self,
        registry: &Registry,
        token: Token,
        want: Interest,
    ) -> io::Result<()> {
        if self.interest != want {
            registry.reregister(&mut self.stream, token, want)?;
            self.interest = want;
        }
        Ok(())
    }
}

/// One non-blocking read. `Ok(None)` means the socket has no more data for
/// now; `Ok(0)` from the OS is an orderly peer shutdown and surfaces as an
/// error so the caller tears the connection down.
fn read_nonblocking(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match stream.read(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                ));
            }
            Ok(n) => return Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::event_loop::test_context;

    #[test]
    fn test_send_queues_and_wakes_once() {
        let (ctx, _poll) = test_context();
        let conn = ConnHandle::stub(1, ctx.clone());

        conn.send(1, b"first").unwrap();
        conn.send(1, b"second").unwrap();
        conn.send(1, b"third").unwrap();

        assert_eq!(conn.queued_frames(), 3);
        // Only the empty->non-empty transition notifies the worker; a write
        // is considered in flight after that.
        let commands = ctx.drain_commands_for_test();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::Flush { conn_id: 1 }));
    }

    #[test]
    fn test_send_on_closed_handle_fails() {
        let (ctx, _poll) = test_context();
        let conn = ConnHandle::stub(2, ctx);

        conn.close();
        match conn.send(1, b"too late") {
            Err(SendError::Closed) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(conn.queued_frames(), 0);
    }

    #[test]
    fn test_send_oversize_payload_fails() {
        let (ctx, _poll) = test_context();
        let conn = ConnHandle::stub(3, ctx);

        let payload = vec![0u8; u16::MAX as usize + 1];
        match conn.send(1, &payload) {
            Err(SendError::Frame(FrameError::BodyTooLarge { .. })) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let (ctx, _poll) = test_context();
        let conn = ConnHandle::stub(4, ctx.clone());

        conn.close();
        conn.close();
        conn.close();

        assert!(conn.is_closed());
        // Exactly one Close command reaches the worker.
        let commands = ctx.drain_commands_for_test();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::Close { conn_id: 4 }));
    }
}
