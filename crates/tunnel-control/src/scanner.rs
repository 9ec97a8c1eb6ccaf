//! Establishment detection on tunnel process output.
//!
//! The tunnel client prints a routing-table-add line once the tunnel is up.
//! The first such line names the remote endpoint, which is the egress address.
//! The line format belongs to the tunnel software, so the pattern is
//! configurable; it must either define a named group `addr` or a first
//! capture group holding the address. Optional `prefix` and `netmask` groups
//! let network routes be told apart from host routes.
//!
//! Only a host route to a routable address counts. Lines for `default`, the
//! `0.0.0.0/1` and `128.0.0.0/1` halves, or pushed subnets are skipped and
//! scanning continues.

use std::net::{IpAddr, Ipv4Addr};

use regex::Regex;

/// Matches both `ip route add 1.2.3.4/32 via ...` and `route add -net 1.2.3.4 netmask ...`.
pub const DEFAULT_ESTABLISHED_PATTERN: &str = r"route add\s+(?:-net\s+|-host\s+)?(?P<addr>[0-9A-Fa-f:.]+)(?:/(?P<prefix>\d+))?(?:\s+netmask\s+(?P<netmask>[0-9.]+))?";

#[derive(Debug, Clone)]
pub struct EstablishmentScanner {
    pattern: Regex,
}

impl EstablishmentScanner {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(pattern)?;
        if pattern.captures_len() < 2 {
            return Err(regex::Error::Syntax(
                "establishment pattern needs a capture group for the address".into(),
            ));
        }
        Ok(Self { pattern })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Egress address announced by `line`, if it is the establishment marker.
    pub fn scan(&self, line: &str) -> Option<String> {
        let caps = self.pattern.captures(line)?;
        let addr = caps.name("addr").or_else(|| caps.get(1))?;
        let addr: IpAddr = addr.as_str().trim().parse().ok()?;
        if !is_routable(&addr) {
            return None;
        }

        let host_bits = if addr.is_ipv4() { 32 } else { 128 };
        if let Some(prefix) = caps.name("prefix") {
            if prefix.as_str().parse::<u8>().ok()? != host_bits {
                return None;
            }
        }
        if let Some(netmask) = caps.name("netmask") {
            if netmask.as_str().parse::<Ipv4Addr>().ok()? != Ipv4Addr::BROADCAST {
                return None;
            }
        }
        Some(addr.to_string())
    }
}

fn is_routable(addr: &IpAddr) -> bool {
    if addr.is_unspecified() || addr.is_loopback() || addr.is_multicast() {
        return false;
    }
    match addr {
        IpAddr::V4(v4) => !v4.is_broadcast() && !v4.is_link_local(),
        IpAddr::V6(_) => true,
    }
}

impl Default for EstablishmentScanner {
    fn default() -> Self {
        Self::new(DEFAULT_ESTABLISHED_PATTERN).expect("default establishment pattern is valid")
    }
}
