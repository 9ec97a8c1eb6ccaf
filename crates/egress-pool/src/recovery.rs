//! Periodic re-admission of failed slots
//!
//! Slots whose renewal retries ran out sit in `Failed` until something
//! renews them again. This task does that on a fixed interval; operators can
//! also trigger it per slot through the admin API.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::renewal::RenewalWorker;

/// Spawn a task that schedules a renewal for every failed slot each
/// `interval`. The first cycle runs one interval after startup.
pub fn spawn_recovery_task(
    worker: Arc<RenewalWorker>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; activation is still running
        ticker.tick().await;

        loop {
            ticker.tick().await;
            recovery_cycle(&worker);
        }
    })
}

/// Schedule renewal of every failed slot. Returns how many were scheduled.
fn recovery_cycle(worker: &Arc<RenewalWorker>) -> usize {
    let failed = worker.registry().failed();
    if failed.is_empty() {
        debug!("no failed slots");
        return 0;
    }
    info!(count = failed.len(), "re-admitting failed slots");
    let count = failed.len();
    for key in failed {
        worker.spawn(key);
    }
    count
}
