use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use chat_utils::ThreadPriority;
use tracing::info;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::listener::bind_reusable;
use crate::pool::{ShutdownMode, WorkerPool};
use crate::registry::ConnectionRegistry;
use crate::timer::{AUDIT_INTERVAL, arm_periodic_sigalrm};

/// Fixed worker-pool size, per §4.4.
const WORKER_POOL_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listening socket on port {port}: {source}")]
    Bind { port: u16, #[source] source: io::Error },
    #[error("failed to set up the readiness instance: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to arm the idle-auditor timer: {0}")]
    Timer(#[source] io::Error),
}

/// Boots and runs the chat core end to end: binds the listening socket,
/// wires up the worker pool, connection registry and readiness dispatcher,
/// arms the idle-auditor timer, then blocks running the dispatcher loop
/// until `SIGINT`. Returns once every in-flight task has drained.
///
/// This is the single owning point for the registry, pool and readiness
/// instance named in Design Notes §9 ("there is no global state essential";
/// see `crate::dispatcher::Dispatcher` and `crate::registry::ConnectionRegistry`).
pub fn begin_server(config: Config) -> Result<(), ServerError> {
    let addr: SocketAddr =
        format!("0.0.0.0:{}", config.port).parse().expect("a u16 port always yields a valid SocketAddr");
    let listener =
        bind_reusable(addr).map_err(|source| ServerError::Bind { port: config.port, source })?;
    run_with_listener(listener, config)
}

/// Same as [`begin_server`], but takes an already-bound, already-nonblocking
/// listener. Split out so integration tests can bind an ephemeral port
/// (`127.0.0.1:0`) themselves and learn the real port before handing the
/// listener off, which `begin_server`'s own bind step doesn't expose.
pub fn run_with_listener(
    listener: mio::net::TcpListener,
    config: Config,
) -> Result<(), ServerError> {
    let poll = mio::Poll::new().map_err(ServerError::Poll)?;
    let registry_mio_handle = poll.registry().try_clone().map_err(ServerError::Poll)?;
    let registry = Arc::new(ConnectionRegistry::new(registry_mio_handle));
    let pool = Arc::new(WorkerPool::new(WORKER_POOL_SIZE, ThreadPriority::OSDefault, false));

    let mut dispatcher = Dispatcher::new(
        poll,
        listener,
        Arc::clone(&registry),
        Arc::clone(&pool),
        config.max_connections,
    )
    .map_err(ServerError::Poll)?;

    arm_periodic_sigalrm(AUDIT_INTERVAL).map_err(ServerError::Timer)?;

    info!(port = config.port, max_connections = config.max_connections, "chatd accepting connections");
    dispatcher.run();
    // Drop the dispatcher's `Arc` clones of the registry and pool before
    // shutting the pool down, so nothing but already-queued/in-flight tasks
    // still references either.
    drop(dispatcher);

    info!("dispatcher stopped, draining worker pool");
    pool.shutdown(ShutdownMode::Drain);
    pool.join();

    info!(remaining_connections = registry.len(), "shutdown complete");
    Ok(())
}
