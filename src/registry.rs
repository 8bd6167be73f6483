//! Message-handler registry.
//!
//! Maps message-type ids to handler functions. The registry is populated
//! once during startup and then moved into the dispatch consumer, so it is
//! write-once-then-read-only by construction: after the move there is no
//! mutable access left anywhere in the process.

use crate::runtime::ConnHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Handler invoked for one inbound message.
///
/// Runs on the single dispatch thread: it may call [`ConnHandle::send`] zero
/// or more times, but must not block for long periods or every other
/// connection's messages stall behind it. Slow work belongs on the
/// [`TaskPool`](crate::runtime::TaskPool).
pub type Handler = Box<dyn Fn(&Arc<ConnHandle>, u16, &[u8]) + Send + Sync>;

/// Write-once mapping from message-type id to handler.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: HashMap<u16, Handler>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `msg_id`. Registering the same id again replaces
    /// the previous handler.
    pub fn register<F>(&mut self, msg_id: u16, handler: F)
    where
        F: Fn(&Arc<ConnHandle>, u16, &[u8]) + Send + Sync + 'static,
    {
        if self.handlers.insert(msg_id, Box::new(handler)).is_some() {
            warn!(msg_id, "Handler replaced for already-registered message id");
        }
    }

    /// Look up the handler for `msg_id`.
    ///
    /// `None` is not an error: unroutable messages are dropped by the
    /// dispatch consumer.
    pub fn lookup(&self, msg_id: u16) -> Option<&Handler> {
        self.handlers.get(&msg_id)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check whether any handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = CallbackRegistry::new();
        assert!(registry.is_empty());

        registry.register(1, |_conn, _msg_id, _payload| {});
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(1).is_some());
        assert!(registry.lookup(2).is_none());
    }

    #[test]
    fn test_reregister_replaces_handler() {
        let hits = Arc::new(AtomicUsize::new(0));

        let mut registry = CallbackRegistry::new();
        registry.register(1, |_conn, _msg_id, _payload| {
            panic!("stale handler should never run");
        });

        let hits_clone = Arc::clone(&hits);
        registry.register(1, move |_conn, msg_id, _payload| {
            assert_eq!(msg_id, 1);
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(registry.len(), 1);

        let (ctx, _poll) = crate::runtime::test_context();
        let conn = ConnHandle::stub(1, ctx);
        let handler = registry.lookup(1).unwrap();
        handler(&conn, 1, b"x");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
