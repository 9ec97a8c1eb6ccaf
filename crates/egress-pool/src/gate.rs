//! Availability gate
//!
//! Callers wait here until at least one slot is ready. While the pool is
//! empty, every waiter attaches to one shared in-flight wait instead of
//! polling on its own. The wait wakes on the registry's readiness broadcast
//! and re-checks once a second as a safety net; there is no overall timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::Shared;
use tracing::{debug, info};

use crate::registry::SlotRegistry;

pub const DEFAULT_RECHECK: Duration = Duration::from_secs(1);

type Wait = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

pub struct AvailabilityGate {
    registry: Arc<SlotRegistry>,
    in_flight: Mutex<Option<Wait>>,
    available: AtomicBool,
    /// Number of shared waits started so far.
    flights: AtomicU64,
    recheck: Duration,
}

impl AvailabilityGate {
    pub fn new(registry: Arc<SlotRegistry>) -> Self {
        Self::with_recheck(registry, DEFAULT_RECHECK)
    }

    pub fn with_recheck(registry: Arc<SlotRegistry>, recheck: Duration) -> Self {
        Self {
            registry,
            in_flight: Mutex::new(None),
            available: AtomicBool::new(false),
            flights: AtomicU64::new(0),
            recheck,
        }
    }

    /// Last observed availability.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Resolve to the keys of the ready slots, waiting if there are none.
    pub async fn await_available(&self) -> Vec<String> {
        loop {
            let ready = self.registry.all_ready();
            if !ready.is_empty() {
                if !self.available.swap(true, Ordering::Relaxed) {
                    info!(ready = ready.len(), "pool available");
                }
                return ready;
            }
            if self.available.swap(false, Ordering::Relaxed) {
                info!("no ready slots, requests are waiting");
            }
            self.shared_wait().await;
        }
    }

    fn shared_wait(&self) -> Wait {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(wait) = in_flight.as_ref() {
            if wait.peek().is_none() {
                return wait.clone();
            }
        }

        let flight = self.flights.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(flight, "starting availability wait");
        let fut: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(wait_for_ready(self.registry.clone(), self.recheck));
        let wait = fut.shared();
        *in_flight = Some(wait.clone());
        wait
    }
}

async fn wait_for_ready(registry: Arc<SlotRegistry>, recheck: Duration) {
    let mut epochs = registry.subscribe();
    loop {
        if !registry.all_ready().is_empty() {
            return;
        }
        tokio::select! {
            changed = epochs.changed() => {
                // Sender lives as long as the registry; fall back to the timer.
                if changed.is_err() {
                    tokio::time::sleep(recheck).await;
                }
            }
            _ = tokio::time::sleep(recheck) => {}
        }
    }
}
