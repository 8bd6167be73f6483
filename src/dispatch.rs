//! Single-consumer dispatch queue.
//!
//! Decouples the network workers from business-logic execution: workers push
//! decoded messages onto a shared FIFO and return to their event loops, while
//! one dedicated consumer thread pops envelopes in arrival order and invokes
//! the handler registered for each message id.
//!
//! Exactly one message is being handled at any instant, system-wide. That
//! bounds handler concurrency to one, but gives a total order of effects
//! across all connections and means handlers never need their own locking.

use crate::registry::CallbackRegistry;
use crate::runtime::ConnHandle;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// One fully-framed inbound message.
pub struct InboundMessage {
    /// Message-type id decoded from the frame header.
    pub msg_id: u16,
    /// Complete body, exactly as long as the header declared.
    pub payload: Bytes,
}

/// Unit pushed through the dispatch queue: a message plus a strong handle to
/// the connection it arrived on. The handle keeps the connection's send path
/// reachable (and the handle itself alive) until the consumer is done with
/// the envelope.
pub struct DispatchEnvelope {
    conn: Arc<ConnHandle>,
    msg: InboundMessage,
}

impl DispatchEnvelope {
    pub fn new(conn: Arc<ConnHandle>, msg: InboundMessage) -> Self {
        Self { conn, msg }
    }
}

struct DispatchState {
    queue: VecDeque<DispatchEnvelope>,
    stopping: bool,
}

struct DispatchShared {
    state: Mutex<DispatchState>,
    ready: Condvar,
}

/// Cloneable producer side of the queue.
#[derive(Clone)]
pub struct DispatchHandle {
    shared: Arc<DispatchShared>,
}

impl DispatchHandle {
    /// Append an envelope and wake the consumer if the queue was empty.
    ///
    /// Envelopes posted after shutdown began are dropped: the consumer takes
    /// one drain snapshot and exits, so late arrivals have no one left to
    /// process them.
    pub fn post(&self, envelope: DispatchEnvelope) {
        let became_nonempty = {
            let mut state = self.shared.state.lock();
            if state.stopping {
                debug!(
                    conn_id = envelope.conn.id(),
                    msg_id = envelope.msg.msg_id,
                    "Dispatch queue stopping, message dropped"
                );
                return;
            }
            state.queue.push_back(envelope);
            state.queue.len() == 1
        };
        if became_nonempty {
            self.shared.ready.notify_one();
        }
    }
}

/// The queue itself: shared state plus the consumer thread.
pub struct DispatchQueue {
    shared: Arc<DispatchShared>,
    consumer: Option<JoinHandle<()>>,
}

impl DispatchQueue {
    /// Spawn the consumer thread over `registry`.
    ///
    /// The registry is moved in, which is what freezes it: no mutable access
    /// survives outside the consumer.
    pub fn start(registry: CallbackRegistry) -> io::Result<Self> {
        let shared = Arc::new(DispatchShared {
            state: Mutex::new(DispatchState {
                queue: VecDeque::new(),
                stopping: false,
            }),
            ready: Condvar::new(),
        });

        let consumer = thread::Builder::new().name("dispatch".to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || consume(shared, registry)
        })?;

        Ok(Self {
            shared,
            consumer: Some(consumer),
        })
    }

    /// Get a producer handle for workers.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop the consumer and join it.
    ///
    /// The consumer first processes every envelope already queued, in order,
    /// then exits. Safe to call more than once; only the first call does
    /// anything.
    pub fn shutdown(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        {
            self.shared.state.lock().stopping = true;
        }
        self.shared.ready.notify_one();
        if consumer.join().is_err() {
            error!("Dispatch consumer thread panicked");
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consume(shared: Arc<DispatchShared>, registry: CallbackRegistry) {
    if registry.is_empty() {
        warn!("No handlers registered; every inbound message will be dropped");
    }
    debug!(handlers = registry.len(), "Dispatch consumer started");

    loop {
        let envelope = {
            let mut state = shared.state.lock();
            while state.queue.is_empty() && !state.stopping {
                shared.ready.wait(&mut state);
            }
            if state.stopping {
                // Drain everything already queued, in order, before exiting.
                let rest = std::mem::take(&mut state.queue);
                drop(state);
                let drained = rest.len();
                for envelope in rest {
                    deliver(&registry, envelope);
                }
                debug!(drained, "Dispatch consumer stopped");
                return;
            }
            state.queue.pop_front()
        };

        if let Some(envelope) = envelope {
            deliver(&registry, envelope);
        }
    }
}

/// Invoke the handler for one envelope, or drop it if the id is unroutable.
///
/// Handler panics are contained here: the consumer must outlive any one
/// misbehaving handler, so the panic is caught and logged instead of tearing
/// down the thread.
fn deliver(registry: &CallbackRegistry, envelope: DispatchEnvelope) {
    let DispatchEnvelope { conn, msg } = envelope;

    let Some(handler) = registry.lookup(msg.msg_id) else {
        debug!(
            conn_id = conn.id(),
            msg_id = msg.msg_id,
            "No handler registered, message dropped"
        );
        return;
    };

    let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
        handler(&conn, msg.msg_id, msg.payload.as_ref());
    }));
    if invoked.is_err() {
        error!(
            conn_id = conn.id(),
            msg_id = msg.msg_id,
            "Handler panicked, message abandoned"
        );
    }
}
