//! Echo-style demo handlers.
//!
//! Covers the handler shapes an application is expected to use:
//!
//! - uppercase echo answers inline on the dispatch thread, the right shape
//!   for cheap handlers;
//! - reverse hands its work to the task pool first, the required shape for
//!   anything slow, since a blocking handler stalls every other message in
//!   the system behind it;
//! - goodbye closes the connection from a handler.

use crate::registry::CallbackRegistry;
use crate::runtime::TaskPoolHandle;
use std::sync::Arc;
use tracing::debug;

/// Inbound echo request; payload is uppercased into the reply.
pub const MSG_ECHO: u16 = 1;
/// Reply id for [`MSG_ECHO`].
pub const MSG_ECHO_REPLY: u16 = 2;
/// Inbound reverse request, answered off the dispatch thread.
pub const MSG_REVERSE: u16 = 3;
/// Reply id for [`MSG_REVERSE`].
pub const MSG_REVERSE_REPLY: u16 = 4;
/// Client goodbye; the gateway closes the connection, no reply.
pub const MSG_BYE: u16 = 5;

/// Bind the demo handlers. Call before any traffic can arrive.
pub fn register(registry: &mut CallbackRegistry, tasks: TaskPoolHandle) {
    registry.register(MSG_ECHO, |conn, _msg_id, payload| {
        let upper: Vec<u8> = payload.iter().map(u8::to_ascii_uppercase).collect();
        if let Err(e) = conn.send(MSG_ECHO_REPLY, &upper) {
            debug!(conn_id = conn.id(), error = %e, "Echo reply dropped");
        }
    });

    registry.register(MSG_REVERSE, move |conn, _msg_id, payload| {
        let conn = Arc::clone(conn);
        let mut data = payload.to_vec();
        tasks.spawn(move || {
            data.reverse();
            if let Err(e) = conn.send(MSG_REVERSE_REPLY, &data) {
                debug!(conn_id = conn.id(), error = %e, "Reverse reply dropped");
            }
        });
    });

    registry.register(MSG_BYE, |conn, _msg_id, _payload| {
        debug!(conn_id = conn.id(), "Client said goodbye");
        conn.close();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{test_context, TaskPool};

    #[test]
    fn test_register_binds_all_ids() {
        let mut tasks = TaskPool::new(1).expect("task pool");
        let mut registry = CallbackRegistry::new();
        register(&mut registry, tasks.handle());

        assert!(registry.lookup(MSG_ECHO).is_some());
        assert!(registry.lookup(MSG_REVERSE).is_some());
        assert!(registry.lookup(MSG_BYE).is_some());
        assert!(registry.lookup(MSG_ECHO_REPLY).is_none());
        tasks.shutdown();
    }

    #[test]
    fn test_echo_handler_uppercases_and_queues_reply() {
        let mut tasks = TaskPool::new(1).expect("task pool");
        let mut registry = CallbackRegistry::new();
        register(&mut registry, tasks.handle());

        let (ctx, _poll) = test_context();
        let conn = crate::runtime::ConnHandle::stub(1, ctx);

        let handler = registry.lookup(MSG_ECHO).expect("echo handler");
        handler(&conn, MSG_ECHO, b"hello world");
        assert_eq!(conn.queued_frames(), 1);

        tasks.shutdown();
    }
}
