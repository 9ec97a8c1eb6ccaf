//! In-memory collaborators for pool tests.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tunnel_control::protocol::{AddressFamily, InterfaceAddress};
use tunnel_control::{ControlError, ExitInfo, InterfaceMap, TunnelControl};

use crate::error::{Error, Result};
use crate::runtime::{InstanceRuntime, InstanceSpec, InstanceSummary};

#[derive(Default)]
struct ControlState {
    connected: Option<String>,
    connects: Vec<String>,
    disconnects: u32,
    failures_left: u32,
}

/// Scripted tunnel controller.
pub(crate) struct FakeControl {
    state: Mutex<ControlState>,
    hold: Option<Arc<Semaphore>>,
}

impl FakeControl {
    pub(crate) fn healthy() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControlState::default()),
            hold: None,
        })
    }

    /// The next `n` connects time out.
    pub(crate) fn failing(n: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControlState {
                failures_left: n,
                ..ControlState::default()
            }),
            hold: None,
        })
    }

    /// Connects wait for a permit on the returned semaphore.
    pub(crate) fn held() -> (Arc<Self>, Arc<Semaphore>) {
        let permits = Arc::new(Semaphore::new(0));
        let fake = Arc::new(Self {
            state: Mutex::new(ControlState::default()),
            hold: Some(permits.clone()),
        });
        (fake, permits)
    }

    pub(crate) fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }

    pub(crate) fn disconnects(&self) -> u32 {
        self.state.lock().unwrap().disconnects
    }
}

impl TunnelControl for FakeControl {
    fn endpoint(&self) -> String {
        "fake".into()
    }

    fn connect<'a>(
        &'a self,
        _vendor: &'a str,
        file: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = tunnel_control::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(hold) = &self.hold {
                hold.acquire().await.unwrap().forget();
            }
            let mut state = self.state.lock().unwrap();
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(ControlError::ConnectTimeout {
                    secs: timeout.as_secs(),
                });
            }
            if state.connected.is_some() {
                return Err(ControlError::AlreadyConnected);
            }
            state.connected = Some(file.to_string());
            state.connects.push(file.to_string());
            Ok(format!("10.0.0.{}", state.connects.len()))
        })
    }

    fn disconnect<'a>(
        &'a self,
        _vendor: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = tunnel_control::Result<ExitInfo>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            match state.connected.take() {
                Some(_) => {
                    state.disconnects += 1;
                    Ok(ExitInfo {
                        code: None,
                        signal: Some(2),
                    })
                }
                None => Err(ControlError::NotConnected),
            }
        })
    }

    fn network_interfaces(
        &self,
    ) -> Pin<Box<dyn Future<Output = tunnel_control::Result<InterfaceMap>> + Send + '_>> {
        Box::pin(async move {
            let mut map = InterfaceMap::new();
            map.insert(
                "lo".into(),
                vec![InterfaceAddress {
                    address: "127.0.0.1".parse().unwrap(),
                    family: AddressFamily::IPv4,
                    netmask: None,
                }],
            );
            if self.state.lock().unwrap().connected.is_some() {
                map.insert("tun0".into(), vec![]);
            }
            Ok(map)
        })
    }
}

#[derive(Default)]
struct RuntimeState {
    next_id: u32,
    instances: BTreeMap<String, InstanceSpec>,
    started: HashSet<String>,
    removed: Vec<String>,
}

/// Runtime keeping instances in memory.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<RuntimeState>,
    /// Instance names whose start fails.
    fail_start: HashSet<String>,
    /// Instance ids whose removal fails.
    fail_remove: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing_start(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail_start: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        })
    }

    pub(crate) fn fail_remove(&self, id: &str) {
        self.fail_remove.lock().unwrap().insert(id.to_string());
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .instances
            .values()
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub(crate) fn specs(&self) -> Vec<InstanceSpec> {
        self.state
            .lock()
            .unwrap()
            .instances
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Pretend an instance from a previous run is still around.
    pub(crate) fn seed(&self, spec: InstanceSpec) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state.instances.insert(id.clone(), spec);
        id
    }
}

impl InstanceRuntime for FakeRuntime {
    fn list_tagged<'a>(
        &'a self,
        image: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InstanceSummary>>> + Send + 'a>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(state
                .instances
                .iter()
                .filter(|(_, spec)| spec.image == image)
                .map(|(id, spec)| InstanceSummary {
                    id: id.clone(),
                    name: spec.name.clone(),
                    state: if state.started.contains(id) {
                        "running".into()
                    } else {
                        "created".into()
                    },
                })
                .collect())
        })
    }

    fn create<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move { Ok(self.seed(spec.clone())) })
    }

    fn start<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let name = state
                .instances
                .get(id)
                .map(|spec| spec.name.clone())
                .unwrap_or_default();
            if self.fail_start.contains(&name) {
                return Err(Error::InstanceLifecycle {
                    op: "start",
                    detail: format!("port is already allocated ({name})"),
                });
            }
            state.started.insert(id.to_string());
            Ok(())
        })
    }

    fn stop<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().unwrap().started.remove(id);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_remove.lock().unwrap().contains(id) {
                return Err(Error::InstanceLifecycle {
                    op: "remove",
                    detail: format!("removal of container {id} is already in progress"),
                });
            }
            let mut state = self.state.lock().unwrap();
            state.started.remove(id);
            if state.instances.remove(id).is_none() {
                return Err(Error::InstanceLifecycle {
                    op: "remove",
                    detail: format!("no such container: {id}"),
                });
            }
            state.removed.push(id.to_string());
            Ok(())
        })
    }
}
