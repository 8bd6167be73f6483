//! framegate: a multi-threaded TCP message gateway
//!
//! Accepts many concurrent client connections, frames a length-prefixed
//! binary protocol, and funnels every decoded message through one serialized
//! dispatch pipeline:
//!
//! - N worker threads, each owning an independent event loop; connections
//!   are assigned round-robin and pinned for life
//! - per-connection framing state machine and FIFO write queue, so one
//!   connection's bytes are never interleaved or reordered
//! - a single dispatch thread invoking the handler registered for each
//!   message id, giving a total order of effects across all connections
//! - a task pool for handler work too slow for the dispatch thread
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod dispatch;
mod handlers;
mod protocol;
mod registry;
mod runtime;
mod server;

use config::Config;
use registry::CallbackRegistry;
use runtime::TaskPool;
use server::Gateway;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        task_threads = config.task_threads,
        max_body_len = config.max_body_len,
        "Starting framegate gateway"
    );

    // Handlers must all be bound before the listener produces traffic.
    let mut tasks = TaskPool::new(config.task_threads)?;
    let mut registry = CallbackRegistry::new();
    handlers::echo::register(&mut registry, tasks.handle());

    let gateway = Gateway::bind(&config, registry)?;
    let result = gateway.run();

    tasks.shutdown();
    result.map_err(Into::into)
}
