//! Built-in message handlers.
//!
//! Handlers are plain functions bound to message-type ids in the
//! [`CallbackRegistry`](crate::registry::CallbackRegistry) at startup. They
//! run on the single dispatch thread and reply through
//! [`ConnHandle::send`](crate::runtime::ConnHandle::send).

pub mod echo;
