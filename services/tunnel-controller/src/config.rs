//! Controller configuration, read from the environment only.

use std::net::SocketAddr;
use std::path::PathBuf;

use tunnel_control::DEFAULT_ESTABLISHED_PATTERN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `CONTROL_LISTEN`
    pub listen_addr: SocketAddr,
    /// `TUNNEL_ROOT`: holds one directory of tunnel files per vendor.
    pub tunnel_root: PathBuf,
    /// `TUNNEL_BINARY`
    pub tunnel_binary: PathBuf,
    /// `ESTABLISHED_PATTERN`
    pub established_pattern: String,
}

impl Config {
    pub fn from_env() -> common::Result<Self> {
        let listen_addr = match non_empty_var("CONTROL_LISTEN") {
            Some(addr) => addr.parse().map_err(|e| {
                common::Error::Config(format!("invalid CONTROL_LISTEN {addr:?}: {e}"))
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 3000)),
        };

        Ok(Self {
            listen_addr,
            tunnel_root: non_empty_var("TUNNEL_ROOT")
                .map_or_else(|| PathBuf::from("/ovpn"), PathBuf::from),
            tunnel_binary: non_empty_var("TUNNEL_BINARY")
                .map_or_else(|| PathBuf::from("openvpn"), PathBuf::from),
            established_pattern: non_empty_var("ESTABLISHED_PATTERN")
                .unwrap_or_else(|| DEFAULT_ESTABLISHED_PATTERN.to_string()),
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
