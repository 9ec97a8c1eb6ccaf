//! Wire protocol types for the instance control channel.
//!
//! One request in flight per connection. The response echoes the request id
//! and carries exactly one of `result` or `error`.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Interface name prefix used by the tunnel device inside an instance.
pub const TUNNEL_INTERFACE_PREFIX: &str = "tun";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: u64,
    pub call: ControlCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ControlCall {
    /// Start the tunnel with `<root>/<vendor>/<file>`.
    Connect {
        vendor: String,
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vendor: Option<String>,
    },
    GetNetworkInterfaces,
}

impl ControlCall {
    pub fn method(&self) -> &'static str {
        match self {
            ControlCall::Connect { .. } => "connect",
            ControlCall::Disconnect { .. } => "disconnect",
            ControlCall::GetNetworkInterfaces => "get_network_interfaces",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ControlResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Fault>,
}

impl ControlResponse {
    pub fn ok(id: u64, result: ControlResult) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn fault(id: u64, err: &ControlError) -> Self {
        Self {
            id,
            result: None,
            error: Some(err.to_fault()),
        }
    }

    /// Collapse into the typed outcome of the call.
    pub fn into_result(self) -> Result<ControlResult> {
        match (self.result, self.error) {
            (_, Some(fault)) => Err(ControlError::from_fault(fault)),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ControlError::Protocol(format!(
                "response {} carries neither result nor error",
                self.id
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlResult {
    Connected { egress: String },
    Disconnected { exit: ExitInfo },
    Interfaces { interfaces: InterfaceMap },
}

/// How the tunnel process ended. Exactly one field is normally set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    IPv4,
    IPv6,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub family: AddressFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<IpAddr>,
}

/// Interface name to its addresses.
pub type InterfaceMap = BTreeMap<String, Vec<InterfaceAddress>>;

/// Name of the first tunnel interface present, if any.
pub fn tunnel_interface(interfaces: &InterfaceMap) -> Option<&str> {
    interfaces
        .keys()
        .find(|name| name.starts_with(TUNNEL_INTERFACE_PREFIX))
        .map(String::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    AlreadyConnected,
    NotConnected,
    Timeout,
    Tunnel,
    Spawn,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}
