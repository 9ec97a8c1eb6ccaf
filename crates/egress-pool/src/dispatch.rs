//! Per-request slot selection
//!
//! `select()` waits for availability, picks a ready slot uniformly at random
//! and admits the request against it. The returned [`Ticket`] lives as long
//! as the request; when the admission crossed the slot's limit, releasing
//! the ticket hands the slot to the renewal worker. Renewal therefore starts
//! only after the response has been delivered (or abandoned).

use std::sync::Arc;

use rand::RngExt;
use tracing::{debug, info, warn};

use crate::gate::AvailabilityGate;
use crate::ports::PortPair;
use crate::registry::{Admission, SlotRegistry};
use crate::renewal::RenewalWorker;

pub struct Dispatcher {
    registry: Arc<SlotRegistry>,
    gate: AvailabilityGate,
    worker: Arc<RenewalWorker>,
    request_limit: u64,
}

impl Dispatcher {
    pub fn new(gate: AvailabilityGate, worker: Arc<RenewalWorker>, request_limit: u64) -> Self {
        Self {
            registry: worker.registry().clone(),
            gate,
            worker,
            request_limit,
        }
    }

    pub fn request_limit(&self) -> u64 {
        self.request_limit
    }

    pub fn is_available(&self) -> bool {
        self.gate.is_available()
    }

    /// Admit one request to a ready slot, waiting for one if necessary.
    pub async fn select(&self) -> Ticket {
        loop {
            let ready = self.gate.await_available().await;
            let key = {
                let index = rand::rng().random_range(0..ready.len());
                &ready[index]
            };

            let Some(admission) = self.registry.admit(key, self.request_limit) else {
                debug!(slot = %key, "slot left rotation before admission, reselecting");
                continue;
            };

            if admission.crossed {
                info!(
                    slot = %admission.key,
                    count = admission.count,
                    limit = self.request_limit,
                    "request limit crossed, slot draining"
                );
            }
            return Ticket {
                admission,
                worker: Some(self.worker.clone()),
            };
        }
    }
}

/// One admitted request.
///
/// Dropping the ticket releases it. A ticket whose admission crossed the
/// limit schedules the slot's renewal on release.
#[derive(Debug)]
#[must_use = "dropping a ticket releases the slot"]
pub struct Ticket {
    admission: Admission,
    worker: Option<Arc<RenewalWorker>>,
}

impl Ticket {
    pub fn key(&self) -> &str {
        &self.admission.key
    }

    pub fn vendor(&self) -> &str {
        &self.admission.vendor
    }

    pub fn ports(&self) -> PortPair {
        self.admission.ports
    }

    pub fn count(&self) -> u64 {
        self.admission.count
    }

    pub fn crossed(&self) -> bool {
        self.admission.crossed
    }

    /// Release explicitly; same as dropping.
    pub fn release(self) {}
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if !self.admission.crossed {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(slot = %self.admission.key, "ticket released outside runtime, renewal not scheduled");
            return;
        }
        debug!(slot = %self.admission.key, "scheduling renewal");
        worker.spawn(self.admission.key.clone());
    }
}
