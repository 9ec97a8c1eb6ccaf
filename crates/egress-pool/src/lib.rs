//! Rotating pool of VPN egress slots
//!
//! Each slot is one disposable instance running an HTTP proxy behind a VPN
//! tunnel. Requests are spread across ready slots at random; once a slot has
//! served its quota the tunnel behind it is swapped for the vendor's next
//! tunnel file while the other slots keep serving.
//!
//! Slot lifecycle:
//! 1. `PoolOrchestrator::bring_up` starts instances → slots `Pending`
//! 2. Activation renewal establishes the first tunnel → `Ready`
//! 3. `Dispatcher::select` admits requests; crossing the limit → `Draining`
//! 4. The crossing request's ticket is released → `RenewalWorker` → `Renewing`
//! 5. New tunnel up → `Ready`, count reset; retries exhausted → `Failed`
//! 6. `Failed` slots return through manual renewal or the recovery task

pub mod catalog;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod ports;
pub mod recovery;
pub mod registry;
pub mod renewal;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{FileCatalog, TunnelFile, VendorStats};
pub use dispatch::{Dispatcher, Ticket};
pub use error::{Error, Result};
pub use gate::AvailabilityGate;
pub use orchestrator::{
    ChannelFactory, PoolOrchestrator, PoolSettings, TcpChannelFactory, TeardownReport, VendorSpec,
};
pub use ports::{PortBases, PortPair};
pub use recovery::spawn_recovery_task;
pub use registry::{SlotRegistry, SlotSnapshot, SlotStatus};
pub use renewal::{RenewalOutcome, RenewalWorker, RetryPolicy};
pub use runtime::{DockerCli, InstanceRuntime, InstanceSpec, VpnCredentials};
