//! Per-worker event loop.
//!
//! Readiness-based model: the poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS, via mio's edge-triggered abstractions.
//!
//! Each [`EventLoop`] is owned by exactly one worker thread for its whole
//! lifetime, and every connection registered with it stays pinned to it until
//! close. Other threads talk to the loop only through its [`ContextHandle`]:
//! commands go into a shared inbox, and a `mio::Waker` kicks the poll so the
//! worker drains the inbox on its own thread. Socket state is therefore
//! mutated by a single thread, ever.

use crate::dispatch::DispatchHandle;
use crate::runtime::connection::{ConnHandle, Connection};
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Token reserved for the cross-thread waker; slab indices grow from zero
/// and can never collide with it.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Events processed per poll round.
const EVENT_CAPACITY: usize = 256;

/// Cross-thread request for a worker.
pub(crate) enum Command {
    /// Adopt a freshly accepted connection.
    Register {
        stream: TcpStream,
        handle: Arc<ConnHandle>,
    },
    /// A sender queued the first frame on an empty outbound queue; start
    /// writing.
    Flush { conn_id: u64 },
    /// Tear the connection down.
    Close { conn_id: u64 },
}

struct ContextShared {
    index: usize,
    inbox: Mutex<Vec<Command>>,
    waker: Waker,
    stopped: AtomicBool,
}

/// Cheaply cloneable handle to one event loop.
#[derive(Clone)]
pub struct ContextHandle {
    shared: Arc<ContextShared>,
}

impl ContextHandle {
    /// Index of this context within its pool.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Hand a newly accepted connection to this context's worker.
    ///
    /// Fails once the loop has been stopped; no further I/O can be scheduled
    /// on a stopped context.
    pub fn register(&self, stream: TcpStream, handle: Arc<ConnHandle>) -> io::Result<()> {
        self.send_command(Command::Register { stream, handle })
    }

    pub(crate) fn send_command(&self, command: Command) -> io::Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "event loop stopped",
            ));
        }
        self.shared.inbox.lock().push(command);
        self.shared.waker.wake()
    }

    /// Ask the worker to exit its loop. The pool joins the thread afterwards.
    pub(crate) fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            error!(worker = self.shared.index, error = %e, "Failed to wake worker for stop");
        }
    }

    #[cfg(test)]
    pub(crate) fn drain_commands_for_test(&self) -> Vec<Command> {
        std::mem::take(&mut *self.shared.inbox.lock())
    }
}

/// The worker-side loop state.
pub(crate) struct EventLoop {
    index: usize,
    poll: Poll,
    shared: Arc<ContextShared>,
    conns: Slab<Connection>,
    /// Connection id -> slab index; commands address connections by id.
    by_id: HashMap<u64, usize>,
    dispatch: DispatchHandle,
    max_body_len: usize,
}

impl EventLoop {
    pub(crate) fn new(
        index: usize,
        dispatch: DispatchHandle,
        max_body_len: usize,
    ) -> io::Result<(Self, ContextHandle)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(ContextShared {
            index,
            inbox: Mutex::new(Vec::new()),
            waker,
            stopped: AtomicBool::new(false),
        });

        let event_loop = Self {
            index,
            poll,
            shared: Arc::clone(&shared),
            conns: Slab::new(),
            by_id: HashMap::new(),
            dispatch,
            max_body_len,
        };
        let handle = ContextHandle { shared };
        Ok((event_loop, handle))
    }

    /// Run until stopped. Consumes the loop; connections still registered at
    /// stop time are torn down before the thread exits.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        info!(worker = self.index, "Worker started");

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.index, error = %e, "Poll failed");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {} // inbox drained below
                    Token(idx) => {
                        if let Err(e) = self.handle_event(idx, event) {
                            debug!(worker = self.index, error = %e, "Connection error");
                            self.close_conn(idx);
                        }
                    }
                }
            }

            self.drain_inbox();

            if self.shared.stopped.load(Ordering::Acquire) {
                break;
            }
        }

        self.teardown();
        info!(worker = self.index, "Worker stopped");
    }

    fn handle_event(&mut self, idx: usize, event: &mio::event::Event) -> io::Result<()> {
        if event.is_readable() {
            let Some(conn) = self.conns.get_mut(idx) else {
                return Ok(()); // stale token
            };
            conn.handle_readable(&self.dispatch, self.max_body_len)?;
        }

        // The readable path may have closed the connection.
        if event.is_writable() {
            let Some(conn) = self.conns.get_mut(idx) else {
                return Ok(());
            };
            conn.flush(self.poll.registry(), Token(idx))?;
        }

        Ok(())
    }

    fn drain_inbox(&mut self) {
        let commands = std::mem::take(&mut *self.shared.inbox.lock());
        for command in commands {
            match command {
                Command::Register { stream, handle } => self.register_conn(stream, handle),
                Command::Flush { conn_id } => {
                    let Some(&idx) = self.by_id.get(&conn_id) else {
                        trace!(worker = self.index, conn_id, "Flush for gone connection");
                        continue;
                    };
                    let result = {
                        // Split borrows: the slab entry and the poll registry.
                        let Some(conn) = self.conns.get_mut(idx) else {
                            continue;
                        };
                        conn.flush(self.poll.registry(), Token(idx))
                    };
                    if let Err(e) = result {
                        debug!(worker = self.index, conn_id, error = %e, "Write error");
                        self.close_conn(idx);
                    }
                }
                Command::Close { conn_id } => {
                    if let Some(&idx) = self.by_id.get(&conn_id) {
                        self.close_conn(idx);
                    }
                }
            }
        }
    }

    fn register_conn(&mut self, stream: TcpStream, handle: Arc<ConnHandle>) {
        let conn_id = handle.id();
        let peer = handle.peer_addr();
        let conn = Connection::new(stream, handle);

        let idx = self.conns.insert(conn);
        let conn = &mut self.conns[idx];
        let interest = conn.initial_interest();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, Token(idx), interest)
        {
            error!(worker = self.index, conn_id, error = %e, "Failed to register connection");
            let conn = self.conns.remove(idx);
            conn.handle.mark_closed();
            return;
        }
        self.by_id.insert(conn_id, idx);

        debug!(
            worker = self.index,
            conn_id,
            peer = %peer,
            "Connection registered"
        );

        // Edge-triggered polls report edges, not levels: bytes that arrived
        // before registration produce no event, so attempt a read right away.
        let result = {
            let Some(conn) = self.conns.get_mut(idx) else {
                return;
            };
            conn.handle_readable(&self.dispatch, self.max_body_len)
        };
        if let Err(e) = result {
            debug!(worker = self.index, conn_id, error = %e, "Connection error");
            self.close_conn(idx);
        }
    }

    fn close_conn(&mut self, idx: usize) {
        if let Some(mut conn) = self.conns.try_remove(idx) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.by_id.remove(&conn.handle.id());
            conn.handle.mark_closed();
            conn.handle.clear_outbound();
            debug!(
                worker = self.index,
                conn_id = conn.handle.id(),
                "Connection closed"
            );
            // Dropping `conn` releases the socket; shared handles may outlive
            // it inside queued dispatch envelopes, but their sends now fail.
        }
    }

    fn teardown(&mut self) {
        // Also covers the poll-failure exit, where nobody called stop():
        // senders must start failing instead of queueing commands forever.
        self.shared.stopped.store(true, Ordering::Release);

        let open = self.conns.len();
        if open > 0 {
            debug!(worker = self.index, open, "Closing connections at shutdown");
        }
        for (_, conn) in self.conns.iter_mut() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            conn.handle.mark_closed();
            conn.handle.clear_outbound();
        }
        self.conns.clear();
        self.by_id.clear();
    }
}

/// Build a detached context (a live waker over a private poll) for tests
/// that need a `ContextHandle` without a running worker thread. The poll is
/// returned so it outlives the waker.
#[cfg(test)]
pub(crate) fn test_context() -> (ContextHandle, Poll) {
    let poll = Poll::new().expect("create poll");
    let waker = Waker::new(poll.registry(), WAKER_TOKEN).expect("create waker");
    let shared = Arc::new(ContextShared {
        index: 0,
        inbox: Mutex::new(Vec::new()),
        waker,
        stopped: AtomicBool::new(false),
    });
    (ContextHandle { shared }, poll)
}
