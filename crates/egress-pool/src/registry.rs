//! Slot registry and readiness state machine
//!
//! The registry owns every pool slot. All mutations happen under one
//! `std::sync::Mutex`; critical sections are short and never await, so
//! readers never observe a torn status/count pair.
//!
//! Slot lifecycle:
//! 1. Orchestrator registers the slot as `Pending` with a seeded request count
//! 2. Activation renewal establishes the first tunnel → `Ready`
//! 3. Admission pushes the count past the limit → `Draining`
//! 4. Renewal worker takes over → `Renewing`
//! 5. Success → `Ready` with the count reset to zero; retries exhausted → `Failed`
//!
//! Every transition into `Ready` bumps a `watch` epoch so waiters in the
//! availability gate wake up without polling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tunnel_control::TunnelControl;

use crate::error::{Error, Result};
use crate::ports::PortPair;

/// Readiness of one slot. Only `Ready` slots are selectable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotStatus {
    /// Instance started, no tunnel established yet
    Pending,
    Ready,
    /// Limit crossed, renewal scheduled for when the last request finishes
    Draining,
    Renewing,
    /// Renewal retries exhausted; needs re-admission
    Failed { reason: String },
}

impl SlotStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SlotStatus::Pending => "pending",
            SlotStatus::Ready => "ready",
            SlotStatus::Draining => "draining",
            SlotStatus::Renewing => "renewing",
            SlotStatus::Failed { .. } => "failed",
        }
    }
}

/// The tunnel currently established in a slot's instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTunnel {
    pub file: String,
    pub egress: String,
}

/// Point-in-time copy of a slot, for health output and tests.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub key: String,
    pub vendor: String,
    pub ports: PortPair,
    pub request_count: u64,
    pub status: SlotStatus,
    pub tunnel: Option<ActiveTunnel>,
    pub renewing: bool,
    pub control_endpoint: String,
}

/// Result of admitting one request to a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub key: String,
    pub vendor: String,
    pub ports: PortPair,
    /// Request count after this admission.
    pub count: u64,
    /// This admission pushed the count past the limit.
    pub crossed: bool,
}

/// What the renewal worker needs to drive one slot.
#[derive(Clone)]
pub struct RenewalTarget {
    pub key: String,
    pub vendor: String,
    pub channel: Arc<dyn TunnelControl>,
}

struct SlotEntry {
    vendor: String,
    ports: PortPair,
    request_count: u64,
    status: SlotStatus,
    channel: Arc<dyn TunnelControl>,
    tunnel: Option<ActiveTunnel>,
    renewing: bool,
    /// A first tunnel has been established at some point.
    activated: bool,
}

pub struct SlotRegistry {
    slots: Mutex<BTreeMap<String, SlotEntry>>,
    ready_epoch: watch::Sender<u64>,
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotRegistry {
    pub fn new() -> Self {
        let (ready_epoch, _) = watch::channel(0);
        Self {
            slots: Mutex::new(BTreeMap::new()),
            ready_epoch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SlotEntry>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_epoch(&self) {
        self.ready_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Add a slot in `Pending` state. Re-registering a key replaces it.
    pub fn register(
        &self,
        key: String,
        vendor: String,
        ports: PortPair,
        channel: Arc<dyn TunnelControl>,
        initial_count: u64,
    ) {
        debug!(slot = %key, vendor = %vendor, initial_count, "slot registered");
        self.lock().insert(
            key,
            SlotEntry {
                vendor,
                ports,
                request_count: initial_count,
                status: SlotStatus::Pending,
                channel,
                tunnel: None,
                renewing: false,
                activated: false,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Keys of every slot currently selectable.
    pub fn all_ready(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, slot)| slot.status == SlotStatus::Ready)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys of every slot whose renewal retries were exhausted.
    pub fn failed(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, slot)| matches!(slot.status, SlotStatus::Failed { .. }))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<SlotSnapshot> {
        self.lock().get(key).map(|slot| snapshot_of(key, slot))
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.lock()
            .iter()
            .map(|(key, slot)| snapshot_of(key, slot))
            .collect()
    }

    /// Take a ready slot out of rotation. Other states are left alone.
    pub fn mark_not_ready(&self, key: &str) -> Result<()> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| Error::SlotNotFound(key.to_string()))?;
        if slot.status == SlotStatus::Ready {
            slot.status = SlotStatus::Draining;
        }
        Ok(())
    }

    pub fn mark_ready(&self, key: &str, reset_count: bool) -> Result<()> {
        {
            let mut slots = self.lock();
            let slot = slots
                .get_mut(key)
                .ok_or_else(|| Error::SlotNotFound(key.to_string()))?;
            slot.status = SlotStatus::Ready;
            if reset_count {
                slot.request_count = 0;
            }
        }
        self.bump_epoch();
        Ok(())
    }

    pub fn increment(&self, key: &str) -> Result<u64> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| Error::SlotNotFound(key.to_string()))?;
        slot.request_count += 1;
        Ok(slot.request_count)
    }

    /// Count one request against a ready slot.
    ///
    /// Increment, threshold check and the `Ready → Draining` transition happen
    /// in one critical section. Returns `None` if the slot is missing or no
    /// longer ready.
    pub fn admit(&self, key: &str, limit: u64) -> Option<Admission> {
        let mut slots = self.lock();
        let slot = slots.get_mut(key)?;
        if slot.status != SlotStatus::Ready {
            return None;
        }
        slot.request_count += 1;
        let crossed = slot.request_count > limit;
        if crossed {
            slot.status = SlotStatus::Draining;
        }
        Some(Admission {
            key: key.to_string(),
            vendor: slot.vendor.clone(),
            ports: slot.ports,
            count: slot.request_count,
            crossed,
        })
    }

    /// Claim the slot for renewal. At most one claim is held per slot.
    pub fn begin_renewal(&self, key: &str) -> Result<RenewalTarget> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| Error::SlotNotFound(key.to_string()))?;
        if slot.renewing {
            return Err(Error::RenewalInProgress(key.to_string()));
        }
        slot.renewing = true;
        slot.status = SlotStatus::Renewing;
        Ok(RenewalTarget {
            key: key.to_string(),
            vendor: slot.vendor.clone(),
            channel: slot.channel.clone(),
        })
    }

    /// Finish a successful renewal: slot becomes `Ready`.
    ///
    /// The count resets to zero, except on the very first activation where the
    /// seeded count is kept so slots of one vendor rotate at staggered times.
    pub fn complete_renewal(&self, key: &str, tunnel: ActiveTunnel) -> Result<()> {
        {
            let mut slots = self.lock();
            let slot = slots
                .get_mut(key)
                .ok_or_else(|| Error::SlotNotFound(key.to_string()))?;
            if slot.activated {
                slot.request_count = 0;
            }
            info!(
                slot = key,
                file = %tunnel.file,
                egress = %tunnel.egress,
                request_count = slot.request_count,
                "slot ready"
            );
            slot.activated = true;
            slot.status = SlotStatus::Ready;
            slot.tunnel = Some(tunnel);
            slot.renewing = false;
        }
        self.bump_epoch();
        Ok(())
    }

    /// Give up on the slot until it is re-admitted.
    pub fn mark_failed(&self, key: &str, reason: String) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(key) {
            warn!(slot = key, reason = %reason, "slot failed");
            slot.status = SlotStatus::Failed { reason };
            slot.tunnel = None;
            slot.renewing = false;
        }
    }

    /// Readiness broadcast. The value changes every time a slot becomes ready.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.ready_epoch.subscribe()
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all ready → healthy, some ready → degraded,
    /// none ready → unhealthy.
    pub fn health(&self) -> serde_json::Value {
        let slots = self.snapshot();
        let total = slots.len();
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for slot in &slots {
            *counts.entry(slot.status.label()).or_default() += 1;
        }
        let ready = counts.get("ready").copied().unwrap_or(0);

        let status = if ready == total && total > 0 {
            "healthy"
        } else if ready > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "slots_total": total,
            "slots_ready": ready,
            "slots_pending": counts.get("pending").copied().unwrap_or(0),
            "slots_draining": counts.get("draining").copied().unwrap_or(0),
            "slots_renewing": counts.get("renewing").copied().unwrap_or(0),
            "slots_failed": counts.get("failed").copied().unwrap_or(0),
            "slots": slots,
        })
    }
}

fn snapshot_of(key: &str, slot: &SlotEntry) -> SlotSnapshot {
    SlotSnapshot {
        key: key.to_string(),
        vendor: slot.vendor.clone(),
        ports: slot.ports,
        request_count: slot.request_count,
        status: slot.status.clone(),
        tunnel: slot.tunnel.clone(),
        renewing: slot.renewing,
        control_endpoint: slot.channel.endpoint(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::FakeControl;

    pub(crate) fn registry_with(keys: &[&str]) -> SlotRegistry {
        let registry = SlotRegistry::new();
        for (i, key) in keys.iter().enumerate() {
            registry.register(
                key.to_string(),
                "pia".into(),
                PortPair {
                    proxy: 9000 + i as u16,
                    control: 3000 + i as u16,
                },
                FakeControl::healthy(),
                0,
            );
        }
        registry
    }

    fn tunnel(file: &str) -> ActiveTunnel {
        ActiveTunnel {
            file: file.into(),
            egress: "185.1.2.3".into(),
        }
    }

    #[test]
    fn registered_slots_start_pending_and_unselectable() {
        let registry = registry_with(&["pia-9000", "pia-9001"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.all_ready().is_empty());
        assert_eq!(
            registry.get("pia-9000").unwrap().status,
            SlotStatus::Pending
        );
    }

    #[test]
    fn admit_crosses_limit_on_the_request_after_it() {
        let registry = registry_with(&["pia-9000"]);
        registry.mark_ready("pia-9000", true).unwrap();

        for expected in 1..=3 {
            let admission = registry.admit("pia-9000", 3).unwrap();
            assert_eq!(admission.count, expected);
            assert!(!admission.crossed);
        }
        let fourth = registry.admit("pia-9000", 3).unwrap();
        assert!(fourth.crossed);
        assert_eq!(
            registry.get("pia-9000").unwrap().status,
            SlotStatus::Draining
        );

        assert!(registry.admit("pia-9000", 3).is_none());
        assert_eq!(registry.get("pia-9000").unwrap().request_count, 4);
    }

    #[test]
    fn admit_rejects_unknown_slot() {
        let registry = registry_with(&[]);
        assert!(registry.admit("nope", 3).is_none());
    }

    #[test]
    fn renewal_claim_is_exclusive() {
        let registry = registry_with(&["pia-9000"]);
        registry.begin_renewal("pia-9000").unwrap();
        assert!(matches!(
            registry.begin_renewal("pia-9000"),
            Err(Error::RenewalInProgress(_))
        ));
        assert_eq!(
            registry.get("pia-9000").unwrap().status,
            SlotStatus::Renewing
        );
    }

    #[test]
    fn first_activation_keeps_seed_later_renewals_reset() {
        let registry = SlotRegistry::new();
        registry.register(
            "pia-9001".into(),
            "pia".into(),
            PortPair {
                proxy: 9001,
                control: 3001,
            },
            FakeControl::healthy(),
            15,
        );

        registry.begin_renewal("pia-9001").unwrap();
        registry
            .complete_renewal("pia-9001", tunnel("a.ovpn"))
            .unwrap();
        assert_eq!(registry.get("pia-9001").unwrap().request_count, 15);

        registry.admit("pia-9001", 30).unwrap();
        registry.begin_renewal("pia-9001").unwrap();
        // Still 16 while renewing: only success resets.
        assert_eq!(registry.get("pia-9001").unwrap().request_count, 16);
        registry
            .complete_renewal("pia-9001", tunnel("b.ovpn"))
            .unwrap();

        let slot = registry.get("pia-9001").unwrap();
        assert_eq!(slot.request_count, 0);
        assert_eq!(slot.status, SlotStatus::Ready);
        assert!(!slot.renewing);
        assert_eq!(slot.tunnel.unwrap().file, "b.ovpn");
    }

    #[test]
    fn failure_keeps_count_and_releases_claim() {
        let registry = registry_with(&["pia-9000"]);
        registry.increment("pia-9000").unwrap();
        registry.begin_renewal("pia-9000").unwrap();
        registry.mark_failed("pia-9000", "connect timed out".into());

        let slot = registry.get("pia-9000").unwrap();
        assert_eq!(slot.request_count, 1);
        assert!(!slot.renewing);
        assert_eq!(registry.failed(), vec!["pia-9000".to_string()]);
        assert!(registry.begin_renewal("pia-9000").is_ok());
    }

    #[test]
    fn becoming_ready_bumps_epoch() {
        let registry = registry_with(&["pia-9000"]);
        let mut rx = registry.subscribe();
        assert!(!rx.has_changed().unwrap());

        registry.mark_ready("pia-9000", false).unwrap();
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        registry.mark_not_ready("pia-9000").unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn health_status_mapping() {
        let registry = registry_with(&["pia-9000", "pia-9001"]);
        assert_eq!(registry.health()["status"], "unhealthy");

        registry.mark_ready("pia-9000", false).unwrap();
        let health = registry.health();
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["slots_ready"], 1);
        assert_eq!(health["slots_pending"], 1);

        registry.mark_ready("pia-9001", false).unwrap();
        assert_eq!(registry.health()["status"], "healthy");
    }

    #[test]
    fn failed_status_serializes_with_reason() {
        let status = SlotStatus::Failed {
            reason: "boom".into(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["reason"], "boom");
    }
}
