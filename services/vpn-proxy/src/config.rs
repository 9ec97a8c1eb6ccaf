//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tunnel credentials come from `VPN_USER`/`VPN_PASS` or a credentials file
//! and are never read from the TOML itself.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use common::Secret;
use egress_pool::{PoolSettings, PortBases, RetryPolicy, VendorSpec, VpnCredentials};
use regex::Regex;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub vendors: Vec<VendorConfig>,
}

/// Public proxy listener
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Empty string disables the lookup.
    #[serde(default = "default_public_ip_url")]
    pub public_ip_url: String,
}

/// Health, metrics and slot management listener
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_admin_addr(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Requests a slot serves before its tunnel is swapped.
    #[serde(default = "default_request_limit")]
    pub request_limit: u64,
    #[serde(default = "default_proxy_port_base")]
    pub proxy_port_base: u16,
    #[serde(default = "default_control_port_base")]
    pub control_port_base: u16,
    /// Resolved to an absolute path by `Config::load`.
    #[serde(default = "default_tunnel_dir")]
    pub tunnel_dir: PathBuf,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// 0 disables the recovery task.
    #[serde(default)]
    pub recovery_interval_secs: u64,
    /// Two lines: user, password.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(skip)]
    pub credentials: Option<VpnCredentials>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            name_prefix: default_name_prefix(),
            request_limit: default_request_limit(),
            proxy_port_base: default_proxy_port_base(),
            control_port_base: default_control_port_base(),
            tunnel_dir: default_tunnel_dir(),
            connect_timeout_secs: default_connect_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            recovery_interval_secs: 0,
            credentials_file: None,
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VendorConfig {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub max_clients: usize,
    /// Regex over tunnel file names, e.g. `^(us|cl)` for two countries.
    #[serde(default)]
    pub file_pattern: Option<String>,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_public_ip_url() -> String {
    "https://api.ipify.org/?format=json".into()
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_image() -> String {
    "vpnproxy".into()
}

fn default_name_prefix() -> String {
    "proxy".into()
}

fn default_request_limit() -> u64 {
    30
}

fn default_proxy_port_base() -> u16 {
    9000
}

fn default_control_port_base() -> u16 {
    3000
}

fn default_tunnel_dir() -> PathBuf {
    PathBuf::from("./ovpn")
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    1000
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Credential resolution order:
    /// 1. `VPN_USER` and `VPN_PASS` env vars (both set)
    /// 2. `credentials_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(image) = std::env::var("IMAGE_NAME") {
            config.pool.image = image;
        }
        if let Ok(prefix) = std::env::var("DOCKER_PREFIX") {
            config.pool.name_prefix = prefix;
        }

        config.validate()?;
        config.vendor_specs()?;

        config.pool.tunnel_dir = std::path::absolute(&config.pool.tunnel_dir).map_err(|e| {
            common::Error::Config(format!(
                "cannot resolve tunnel_dir {}: {e}",
                config.pool.tunnel_dir.display()
            ))
        })?;

        config.pool.credentials = match (Secret::from_env("VPN_USER"), Secret::from_env("VPN_PASS"))
        {
            (Some(user), Some(pass)) => Some(VpnCredentials { user, pass }),
            _ => match &config.pool.credentials_file {
                Some(file) => Some(read_credentials_file(file)?),
                None => None,
            },
        };

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let invalid = |msg: &str| Err(common::Error::Config(msg.into()));
        if self.proxy.timeout_secs == 0 {
            return invalid("timeout_secs must be greater than 0");
        }
        if self.proxy.max_connections == 0 {
            return invalid("max_connections must be greater than 0");
        }
        if !self.proxy.public_ip_url.is_empty()
            && !self.proxy.public_ip_url.starts_with("http://")
            && !self.proxy.public_ip_url.starts_with("https://")
        {
            return invalid("public_ip_url must start with http:// or https://");
        }
        if self.pool.request_limit == 0 {
            return invalid("request_limit must be greater than 0");
        }
        if self.pool.connect_timeout_secs == 0 {
            return invalid("connect_timeout_secs must be greater than 0");
        }
        if self.pool.retry_attempts == 0 {
            return invalid("retry_attempts must be at least 1");
        }
        if self.pool.image.is_empty() {
            return invalid("pool image must not be empty");
        }

        let mut seen = HashSet::new();
        for vendor in &self.vendors {
            if !is_single_component(&vendor.id) {
                return Err(common::Error::Config(format!(
                    "vendor id {:?} must be a plain directory name",
                    vendor.id
                )));
            }
            if !seen.insert(vendor.id.as_str()) {
                return Err(common::Error::Config(format!(
                    "vendor {} configured twice",
                    vendor.id
                )));
            }
            if vendor.enabled && vendor.max_clients == 0 {
                return Err(common::Error::Config(format!(
                    "vendor {} must have max_clients greater than 0",
                    vendor.id
                )));
            }
        }
        if !self.vendors.iter().any(|v| v.enabled) {
            return invalid("at least one vendor must be enabled");
        }
        Ok(())
    }

    /// Vendors with compiled file filters.
    pub fn vendor_specs(&self) -> common::Result<Vec<VendorSpec>> {
        self.vendors
            .iter()
            .map(|vendor| {
                let file_filter = vendor
                    .file_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| {
                        common::Error::Config(format!(
                            "invalid file_pattern for vendor {}: {e}",
                            vendor.id
                        ))
                    })?;
                Ok(VendorSpec {
                    id: vendor.id.clone(),
                    enabled: vendor.enabled,
                    max_clients: vendor.max_clients,
                    file_filter,
                })
            })
            .collect()
    }

    pub fn port_bases(&self) -> PortBases {
        PortBases {
            proxy: self.pool.proxy_port_base,
            control: self.pool.control_port_base,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.pool.retry_attempts,
            initial_backoff: Duration::from_millis(self.pool.retry_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            image: self.pool.image.clone(),
            name_prefix: self.pool.name_prefix.clone(),
            request_limit: self.pool.request_limit,
            port_bases: self.port_bases(),
            tunnel_dir: self.pool.tunnel_dir.clone(),
            credentials: self.pool.credentials.clone(),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("vpn-proxy.toml")
    }
}

fn is_single_component(id: &str) -> bool {
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn read_credentials_file(path: &Path) -> common::Result<VpnCredentials> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        common::Error::Credentials(format!(
            "failed to read credentials_file {}: {e}",
            path.display()
        ))
    })?;
    let mut lines = contents.lines().map(str::trim);
    let user = lines.next().filter(|l| !l.is_empty());
    let pass = lines.next().filter(|l| !l.is_empty());
    match (user, pass) {
        (Some(user), Some(pass)) => Ok(VpnCredentials {
            user: Secret::new(user.to_owned()),
            pass: Secret::new(pass.to_owned()),
        }),
        _ => Err(common::Error::Credentials(format!(
            "{} must contain a user line and a password line",
            path.display()
        ))),
    }
}
