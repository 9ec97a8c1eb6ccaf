//! Tunnel renewal
//!
//! Swaps the tunnel behind one slot: drop the current tunnel if the instance
//! still has one, pick the vendor's next tunnel file, connect, and put the
//! slot back into rotation. Attempts follow an explicit [`RetryPolicy`];
//! when they run out the slot is parked as `Failed`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tunnel_control::{ControlError, tunnel_interface};

use crate::catalog::{FileCatalog, VendorStats};
use crate::error::{Error, Result};
use crate::registry::{ActiveTunnel, RenewalTarget, SlotRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Factor applied to the delay before each further attempt.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before `attempt` (1-based). The first attempt starts immediately.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.saturating_pow(attempt - 2);
        self.initial_backoff.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalOutcome {
    pub file: String,
    pub egress: String,
    pub attempts: u32,
}

/// Holds the slot's renewal claim. A renewal dropped mid-way (task aborted
/// at shutdown) leaves the slot `Failed` instead of stuck in `Renewing`.
struct RenewalClaim<'a> {
    registry: &'a SlotRegistry,
    key: &'a str,
    settled: bool,
}

impl RenewalClaim<'_> {
    fn succeed(mut self, tunnel: ActiveTunnel) -> Result<()> {
        self.settled = true;
        self.registry.complete_renewal(self.key, tunnel)
    }

    fn fail(mut self, reason: String) {
        self.settled = true;
        self.registry.mark_failed(self.key, reason);
    }
}

impl Drop for RenewalClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry
                .mark_failed(self.key, "renewal cancelled".to_string());
        }
    }
}

pub struct RenewalWorker {
    registry: Arc<SlotRegistry>,
    catalog: Arc<FileCatalog>,
    stats: Arc<VendorStats>,
    policy: RetryPolicy,
    connect_timeout: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl RenewalWorker {
    pub fn new(
        registry: Arc<SlotRegistry>,
        catalog: Arc<FileCatalog>,
        stats: Arc<VendorStats>,
        policy: RetryPolicy,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            catalog,
            stats,
            policy,
            connect_timeout,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    /// Renew one slot, retrying per the policy.
    ///
    /// Fails fast with `RenewalInProgress` if the slot is already being
    /// renewed. On success the slot is `Ready`; on `RenewalExhausted` it is
    /// `Failed`.
    pub async fn renew(&self, key: &str) -> Result<RenewalOutcome> {
        let target = self.registry.begin_renewal(key)?;
        let claim = RenewalClaim {
            registry: &self.registry,
            key,
            settled: false,
        };
        let started = Instant::now();
        info!(slot = key, vendor = %target.vendor, "renewing tunnel");

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts.max(1) {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!(slot = key, attempt, delay_ms = delay.as_millis() as u64, "retrying renewal");
                tokio::time::sleep(delay).await;
            }

            match self.attempt(&target).await {
                Ok(tunnel) => {
                    let outcome = RenewalOutcome {
                        file: tunnel.file.clone(),
                        egress: tunnel.egress.clone(),
                        attempts: attempt,
                    };
                    claim.succeed(tunnel)?;
                    record(&target.vendor, "success", started);
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(slot = key, attempt, error = %e, "renewal attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        let attempts = self.policy.max_attempts.max(1);
        claim.fail(format!("{attempts} renewal attempts failed: {last_error}"));
        record(&target.vendor, "exhausted", started);
        Err(Error::RenewalExhausted {
            key: key.to_string(),
            attempts,
            last_error,
        })
    }

    async fn attempt(&self, target: &RenewalTarget) -> Result<ActiveTunnel> {
        let channel = &target.channel;
        let vendor = target.vendor.as_str();

        let interfaces = channel.network_interfaces().await?;
        if let Some(device) = tunnel_interface(&interfaces) {
            debug!(slot = %target.key, device, "tunnel still up, disconnecting");
            disconnect_tolerant(target).await?;
        }

        let n = self.stats.issue(vendor);
        let file = self.catalog.next(vendor, n)?;
        debug!(slot = %target.key, file = %file.identifier, n, "connecting");

        match channel
            .connect(vendor, &file.identifier, self.connect_timeout)
            .await
        {
            Ok(egress) => Ok(ActiveTunnel {
                file: file.identifier,
                egress,
            }),
            Err(ControlError::AlreadyConnected) => {
                // Controller has a tunnel without a visible device. Clear it
                // so the next attempt starts from Idle.
                disconnect_tolerant(target).await?;
                Err(ControlError::AlreadyConnected.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run `renew(key)` in the background, logging the result.
    pub fn spawn(self: &Arc<Self>, key: String) {
        let worker = self.clone();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            match worker.renew(&key).await {
                Ok(outcome) => info!(
                    slot = %key,
                    file = %outcome.file,
                    egress = %outcome.egress,
                    attempts = outcome.attempts,
                    "renewal complete"
                ),
                Err(Error::RenewalInProgress(_)) => {
                    debug!(slot = %key, "renewal already running")
                }
                Err(e) => warn!(slot = %key, error = %e, "renewal failed"),
            }
        });
    }

    /// Spawn the first renewal of every slot.
    pub fn activate_all(self: &Arc<Self>) {
        for key in self.registry.keys() {
            self.spawn(key);
        }
    }

    /// Renewals currently running in the background.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Abandon every background renewal.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            info!(count = tasks.len(), "abandoning outstanding renewals");
        }
        tasks.abort_all();
    }
}

impl std::fmt::Debug for RenewalWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalWorker")
            .field("policy", &self.policy)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

async fn disconnect_tolerant(target: &RenewalTarget) -> Result<()> {
    match target.channel.disconnect(Some(&target.vendor)).await {
        Ok(exit) => {
            debug!(slot = %target.key, code = ?exit.code, signal = ?exit.signal, "tunnel stopped");
            Ok(())
        }
        Err(ControlError::NotConnected) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn record(vendor: &str, outcome: &'static str, started: Instant) {
    metrics::counter!("pool_renewals_total", "vendor" => vendor.to_string(), "outcome" => outcome)
        .increment(1);
    metrics::histogram!("pool_renewal_duration_seconds", "vendor" => vendor.to_string())
        .record(started.elapsed().as_secs_f64());
}
