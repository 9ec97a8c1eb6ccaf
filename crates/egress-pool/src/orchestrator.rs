//! Pool bring-up and teardown
//!
//! `bring_up` turns the vendor list into running instances and registered
//! slots; `tear_down` force-removes every instance created from the pool
//! image. Instance and catalog failures are contained to the slot or vendor
//! they hit.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use regex::Regex;
use tracing::{debug, error, info, warn};
use tunnel_control::{ChannelSettings, ControlChannel, TunnelControl};

use crate::catalog::FileCatalog;
use crate::error::Result;
use crate::ports::{self, PortBases, PortPair};
use crate::registry::SlotRegistry;
use crate::runtime::{InstanceRuntime, InstanceSpec, VpnCredentials};

/// One tunnel vendor as configured.
#[derive(Debug, Clone)]
pub struct VendorSpec {
    pub id: String,
    pub enabled: bool,
    /// Number of slots (instances) for this vendor.
    pub max_clients: usize,
    /// Only tunnel files whose name matches enter the catalog.
    pub file_filter: Option<Regex>,
}

/// Builds the control channel for a slot's control port.
pub trait ChannelFactory: Send + Sync {
    fn channel(&self, ports: PortPair) -> Arc<dyn TunnelControl>;
}

/// Dials the instance controller over TCP on the host side of its port.
#[derive(Debug, Clone)]
pub struct TcpChannelFactory {
    host: IpAddr,
    settings: ChannelSettings,
}

impl TcpChannelFactory {
    pub fn new(settings: ChannelSettings) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            settings,
        }
    }
}

impl ChannelFactory for TcpChannelFactory {
    fn channel(&self, ports: PortPair) -> Arc<dyn TunnelControl> {
        let addr = SocketAddr::new(self.host, ports.control);
        Arc::new(ControlChannel::new(addr, self.settings.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Image every instance is created from; also the teardown filter.
    pub image: String,
    pub name_prefix: String,
    pub request_limit: u64,
    pub port_bases: PortBases,
    /// Absolute host path of the tunnel directory.
    pub tunnel_dir: PathBuf,
    pub credentials: Option<VpnCredentials>,
}

/// What `tear_down` managed to remove.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub removed: Vec<String>,
    /// `(instance, error)` for every removal that failed.
    pub failed: Vec<(String, String)>,
}

pub struct PoolOrchestrator {
    runtime: Arc<dyn InstanceRuntime>,
    channels: Arc<dyn ChannelFactory>,
    catalog: Arc<FileCatalog>,
    registry: Arc<SlotRegistry>,
    settings: PoolSettings,
}

impl PoolOrchestrator {
    pub fn new(
        runtime: Arc<dyn InstanceRuntime>,
        channels: Arc<dyn ChannelFactory>,
        catalog: Arc<FileCatalog>,
        registry: Arc<SlotRegistry>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            runtime,
            channels,
            catalog,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<FileCatalog> {
        &self.catalog
    }

    /// Start instances for every enabled vendor and register their slots.
    ///
    /// Returns the keys of the registered slots. Only an invalid port plan
    /// is an error; vendors without tunnel files and instances that fail to
    /// start are skipped.
    pub async fn bring_up(&self, vendors: &[VendorSpec]) -> Result<Vec<String>> {
        let enabled: Vec<&VendorSpec> = vendors
            .iter()
            .filter(|v| v.enabled && v.max_clients > 0)
            .collect();
        let counts: Vec<usize> = enabled.iter().map(|v| v.max_clients).collect();
        let plan = ports::plan(self.settings.port_bases, &counts)?;

        let results = join_all(
            enabled
                .iter()
                .zip(plan)
                .map(|(vendor, pairs)| self.bring_up_vendor(vendor, pairs)),
        )
        .await;

        let keys: Vec<String> = results.into_iter().flatten().collect();
        info!(slots = keys.len(), vendors = enabled.len(), "pool brought up");
        Ok(keys)
    }

    async fn bring_up_vendor(&self, vendor: &VendorSpec, pairs: Vec<PortPair>) -> Vec<String> {
        match self
            .catalog
            .load(&vendor.id, vendor.file_filter.as_ref())
            .await
        {
            Ok(_) => {}
            Err(e) => {
                error!(vendor = %vendor.id, error = %e, "skipping vendor");
                return Vec::new();
            }
        }

        // Staggered seeds keep the vendor's slots from rotating in lockstep.
        let stride = self.settings.request_limit / vendor.max_clients as u64;
        let mut keys = Vec::with_capacity(pairs.len());
        for (index, ports) in pairs.into_iter().enumerate() {
            let key = format!("{}-{}", vendor.id, ports.proxy);
            match self.start_instance(&key, ports).await {
                Ok(id) => {
                    let seed = stride * index as u64;
                    debug!(slot = %key, instance = %id, seed, "instance started");
                    self.registry.register(
                        key.clone(),
                        vendor.id.clone(),
                        ports,
                        self.channels.channel(ports),
                        seed,
                    );
                    keys.push(key);
                }
                Err(e) => warn!(slot = %key, error = %e, "slot not started"),
            }
        }
        keys
    }

    async fn start_instance(&self, key: &str, ports: PortPair) -> Result<String> {
        let spec = InstanceSpec {
            image: self.settings.image.clone(),
            name: format!("{}-{key}", self.settings.name_prefix),
            slot_key: key.to_string(),
            ports,
            tunnel_dir: self.settings.tunnel_dir.clone(),
            credentials: self.settings.credentials.clone(),
        };
        let id = self.runtime.create(&spec).await?;
        if let Err(e) = self.runtime.start(&id).await {
            if let Err(cleanup) = self.runtime.remove(&id).await {
                debug!(instance = %id, error = %cleanup, "cleanup of unstarted instance failed");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Force-remove every instance created from the pool image.
    ///
    /// Never fails; problems are logged and listed in the report. Safe to
    /// call repeatedly.
    pub async fn tear_down(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let instances = match self.runtime.list_tagged(&self.settings.image).await {
            Ok(instances) => instances,
            Err(e) => {
                error!(image = %self.settings.image, error = %e, "cannot list instances for teardown");
                report.failed.push((self.settings.image.clone(), e.to_string()));
                return report;
            }
        };
        if instances.is_empty() {
            debug!(image = %self.settings.image, "no instances to remove");
            return report;
        }

        let results = join_all(instances.iter().map(|instance| async move {
            (instance, self.runtime.remove(&instance.id).await)
        }))
        .await;

        for (instance, result) in results {
            match result {
                Ok(()) => {
                    debug!(instance = %instance.name, "instance removed");
                    report.removed.push(instance.id.clone());
                }
                Err(e) => {
                    warn!(instance = %instance.name, error = %e, "instance removal failed");
                    report.failed.push((instance.id.clone(), e.to_string()));
                }
            }
        }
        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "pool torn down"
        );
        report
    }
}
