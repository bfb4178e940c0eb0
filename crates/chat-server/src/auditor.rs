use std::sync::Arc;

use tracing::debug;

use crate::pool::WorkerPool;
use crate::registry::ConnectionRegistry;
use crate::task::{Direction, TaskArgs, spawn_task};

/// Runs once per `SIGALRM` tick (every 10s, see `crate::server`). Enqueues a
/// `Heartbeat` task for every currently registered connection; each task
/// decides for itself, under its own record's mutex, whether the connection
/// has gone idle past `crate::task::IDLE_TIMEOUT`.
///
/// Deliberately does not touch `last_active` itself — only inbound/outbound
/// task turns do that — so a heartbeat can never mask an idle connection as
/// live.
pub fn audit(registry: &Arc<ConnectionRegistry>, pool: &Arc<WorkerPool>) {
    let records = registry.all_records();
    debug!(count = records.len(), "idle auditor tick");
    for record in records {
        let args = TaskArgs {
            direction: Direction::Heartbeat,
            record,
            registry: Arc::clone(registry),
            pool: Arc::clone(pool),
        };
        spawn_task(args);
    }
}
