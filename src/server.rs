//! Gateway server: listener, accept loop, and lifecycle.
//!
//! Accepts connections on a single thread and spreads them across the event
//! loop pool round-robin. Each accepted socket gets a monotonically
//! increasing connection id and is pinned to the context that adopted it.
//! The accept loop is itself a small mio poll (listener + shutdown waker),
//! so `run` can be interrupted cleanly from another thread.

#![allow(dead_code)] // Shutdown handles and address accessors are exercised by the tests

use crate::config::Config;
use crate::dispatch::DispatchQueue;
use crate::registry::CallbackRegistry;
use crate::runtime::{ConnHandle, EventLoopPool};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const SHUTDOWN_TOKEN: Token = Token(usize::MAX - 1);

/// Events processed per accept-loop poll round.
const EVENT_CAPACITY: usize = 64;

/// One-shot remote stop signal for a running [`Gateway`].
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the gateway to stop accepting and tear down its pools.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake accept loop for shutdown");
        }
    }
}

/// The assembled gateway: dispatch queue, event loop pool, and listener.
pub struct Gateway {
    pool: EventLoopPool,
    dispatch: DispatchQueue,
    poll: Poll,
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    next_conn_id: u64,
}

impl Gateway {
    /// Build the full pipeline and bind the listener.
    ///
    /// The registry is frozen here: it moves into the dispatch consumer
    /// before the listener can produce any traffic.
    pub fn bind(config: &Config, registry: CallbackRegistry) -> io::Result<Self> {
        let dispatch = DispatchQueue::start(registry)?;
        let pool = EventLoopPool::new(config.workers, dispatch.handle(), config.max_body_len)?;

        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = create_listener(addr)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), SHUTDOWN_TOKEN)?);

        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            workers = pool.size(),
            max_body_len = config.max_body_len,
            "Gateway listening"
        );

        Ok(Self {
            pool,
            dispatch,
            poll,
            listener,
            stop: Arc::new(AtomicBool::new(false)),
            waker,
            next_conn_id: 0,
        })
    }

    /// Actual bound address; useful when listening on an ephemeral port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that stops a running gateway from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Accept connections until the shutdown handle fires, then stop the
    /// event loop pool and drain the dispatch queue before returning.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Accept poll failed");
                self.teardown();
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready(),
                    SHUTDOWN_TOKEN => {} // stop flag checked by the loop
                    _ => {}
                }
            }
        }

        info!("Gateway shutting down");
        self.teardown();
        Ok(())
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn_id = self.next_conn_id;
                    self.next_conn_id += 1;

                    let ctx = self.pool.acquire().clone();
                    let handle = ConnHandle::new(conn_id, peer, ctx.clone());
                    debug!(
                        conn_id,
                        peer = %peer,
                        worker = ctx.index(),
                        "Accepted connection"
                    );
                    if let Err(e) = ctx.register(stream, handle) {
                        warn!(conn_id, error = %e, "Failed to hand connection to worker");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.pool.shutdown();
        self.dispatch.shutdown();
    }
}

/// Create the listening socket: reuse-address for quick restarts,
/// non-blocking for the poll, fixed backlog.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
