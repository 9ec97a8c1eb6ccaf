//! Instance control channel
//!
//! Each egress instance runs a controller that owns one tunnel process. The
//! pool drives it over TCP with length-prefixed JSON frames:
//!
//! 1. `connect(vendor, file, timeout)` starts the tunnel and resolves to the
//!    egress address once the establishment marker appears on stdout
//! 2. `disconnect(vendor)` interrupts the tunnel and reports how it exited
//! 3. `get_network_interfaces()` lists the instance's interfaces, used to
//!    detect a live tunnel device before reconnecting
//!
//! A controller accepts `connect` only when idle, so an instance never runs
//! two tunnels at once.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod scanner;
pub mod state;

mod client;
mod server;

pub use client::{ChannelSettings, ControlChannel, TunnelControl};
pub use error::{ControlError, Result};
pub use protocol::{ExitInfo, InterfaceMap, tunnel_interface};
pub use scanner::{DEFAULT_ESTABLISHED_PATTERN, EstablishmentScanner};
pub use server::{
    Controller, ControllerSettings, DEFAULT_CONNECT_TIMEOUT, OpenVpnLauncher, TunnelLauncher,
    local_interfaces, serve,
};
