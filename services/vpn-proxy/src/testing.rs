//! Pool fixtures for handler tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use egress_pool::{
    FileCatalog, PortPair, RenewalWorker, RetryPolicy, SlotRegistry, VendorStats,
};
use tunnel_control::{ControlError, ExitInfo, InterfaceMap, TunnelControl};

pub(crate) const VENDOR: &str = "testvpn";

/// Controller that connects instantly, or fails every connect.
pub(crate) struct StubControl {
    fail: AtomicBool,
    pub(crate) connects: AtomicU32,
}

impl StubControl {
    pub(crate) fn up() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            connects: AtomicU32::new(0),
        })
    }

    pub(crate) fn down() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(true),
            connects: AtomicU32::new(0),
        })
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl TunnelControl for StubControl {
    fn endpoint(&self) -> String {
        "stub".into()
    }

    fn connect<'a>(
        &'a self,
        _vendor: &'a str,
        _file: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = tunnel_control::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(ControlError::ConnectTimeout {
                    secs: timeout.as_secs(),
                })
            } else {
                Ok("198.51.100.7".to_string())
            }
        })
    }

    fn disconnect<'a>(
        &'a self,
        _vendor: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = tunnel_control::Result<ExitInfo>> + Send + 'a>> {
        Box::pin(async { Err(ControlError::NotConnected) })
    }

    fn network_interfaces(
        &self,
    ) -> Pin<Box<dyn Future<Output = tunnel_control::Result<InterfaceMap>> + Send + '_>> {
        Box::pin(async { Ok(InterfaceMap::new()) })
    }
}

/// A pool whose slots are backed by the given controllers.
pub(crate) struct TestPool {
    pub(crate) registry: Arc<SlotRegistry>,
    pub(crate) worker: Arc<RenewalWorker>,
    _dir: tempfile::TempDir,
}

/// Register one slot per `(key, proxy_port, control)` under [`VENDOR`].
pub(crate) async fn test_pool(slots: Vec<(&str, u16, Arc<StubControl>)>) -> TestPool {
    let dir = tempfile::tempdir().unwrap();
    let vendor_dir = dir.path().join(VENDOR);
    std::fs::create_dir(&vendor_dir).unwrap();
    std::fs::write(vendor_dir.join("a.ovpn"), "client\n").unwrap();
    std::fs::write(vendor_dir.join("b.ovpn"), "client\n").unwrap();

    let catalog = Arc::new(FileCatalog::new(dir.path()));
    catalog.load(VENDOR, None).await.unwrap();

    let registry = Arc::new(SlotRegistry::new());
    for (i, (key, proxy, control)) in slots.into_iter().enumerate() {
        registry.register(
            key.to_string(),
            VENDOR.to_string(),
            PortPair {
                proxy,
                control: 3000 + i as u16,
            },
            control,
            0,
        );
    }

    let worker = RenewalWorker::new(
        registry.clone(),
        catalog,
        Arc::new(VendorStats::new()),
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        },
        Duration::from_secs(1),
    );

    TestPool {
        registry,
        worker,
        _dir: dir,
    }
}

/// Wait until `key` reaches the state with the given label.
pub(crate) async fn wait_for_state(registry: &SlotRegistry, key: &str, label: &str) {
    for _ in 0..200 {
        if registry.get(key).is_some_and(|s| s.status.label() == label) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("slot {key} never reached {label}");
}
