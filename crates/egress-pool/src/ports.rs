//! Host port assignment for pool slots.
//!
//! Slots are numbered sequentially across all enabled vendors. Slot `i` gets
//! `proxy_base + i` for its data port and `control_base + i` for its control
//! port, so the offset accumulates from one vendor to the next.

use serde::Serialize;

use crate::error::{Error, Result};

/// Host ports bound to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortPair {
    /// HTTP proxy inside the instance.
    pub proxy: u16,
    /// Tunnel controller inside the instance.
    pub control: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBases {
    pub proxy: u16,
    pub control: u16,
}

/// Assign port pairs for vendors needing `counts[v]` slots each.
///
/// Fails if either range runs past 65535 or the two ranges overlap.
pub fn plan(bases: PortBases, counts: &[usize]) -> Result<Vec<Vec<PortPair>>> {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return Ok(counts.iter().map(|_| Vec::new()).collect());
    }

    for (name, base) in [("proxy", bases.proxy), ("control", bases.control)] {
        let last = base as usize + total - 1;
        if last > u16::MAX as usize {
            return Err(Error::PortRange(format!(
                "{total} slots from {name} base {base} run past port 65535"
            )));
        }
    }

    let proxy = bases.proxy as usize..bases.proxy as usize + total;
    let control = bases.control as usize..bases.control as usize + total;
    if proxy.start < control.end && control.start < proxy.end {
        return Err(Error::PortRange(format!(
            "proxy ports {}-{} overlap control ports {}-{}",
            proxy.start,
            proxy.end - 1,
            control.start,
            control.end - 1
        )));
    }

    let mut offset = 0u16;
    let mut out = Vec::with_capacity(counts.len());
    for &count in counts {
        let pairs = (0..count as u16)
            .map(|n| PortPair {
                proxy: bases.proxy + offset + n,
                control: bases.control + offset + n,
            })
            .collect();
        offset += count as u16;
        out.push(pairs);
    }
    Ok(out)
}
