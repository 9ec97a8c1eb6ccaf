//! Instance runtime collaborator
//!
//! Each pool slot runs in a disposable container: an HTTP proxy on port 8118
//! and the tunnel controller on port 3000, both published on loopback only.
//! `DockerCli` drives the `docker` command line; tests substitute an
//! in-memory runtime.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use common::Secret;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ports::PortPair;

/// Container port of the HTTP proxy inside an instance.
pub const INSTANCE_PROXY_PORT: u16 = 8118;
/// Container port of the tunnel controller inside an instance.
pub const INSTANCE_CONTROL_PORT: u16 = 3000;
/// Mount point of the tunnel directory inside an instance.
pub const INSTANCE_TUNNEL_DIR: &str = "/ovpn";
/// Label carrying the slot key on every instance.
pub const SLOT_LABEL: &str = "vpn-proxy.slot";

const DNS_SERVERS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];
const INSTANCE_COMMAND: [&str; 2] = ["supervisord", "-n"];

/// Tunnel account credentials handed to every instance.
#[derive(Debug, Clone)]
pub struct VpnCredentials {
    pub user: Secret<String>,
    pub pass: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub image: String,
    pub name: String,
    pub slot_key: String,
    pub ports: PortPair,
    /// Host directory mounted at `/ovpn`. Must be absolute.
    pub tunnel_dir: PathBuf,
    pub credentials: Option<VpnCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub state: String,
}

/// Lifecycle operations on isolated instances.
pub trait InstanceRuntime: Send + Sync {
    /// Every labelled instance created from exactly `image`, running or not.
    fn list_tagged<'a>(
        &'a self,
        image: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InstanceSummary>>> + Send + 'a>>;

    /// Create the instance, returning its id.
    fn create<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    fn start<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Graceful stop. The pool itself only ever force-removes.
    fn stop<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Force-remove the instance, stopping it if needed.
    fn remove<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Runtime backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments for `docker create`.
    ///
    /// Credentials are passed by name only (`--env VPN_USER`), docker reads
    /// the values from its own environment so they never show up in the
    /// process list.
    pub fn create_args(spec: &InstanceSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.clone(),
            "--tty".into(),
            "--label".into(),
            format!("{SLOT_LABEL}={}", spec.slot_key),
            "--publish".into(),
            format!("127.0.0.1:{}:{INSTANCE_PROXY_PORT}", spec.ports.proxy),
            "--publish".into(),
            format!("127.0.0.1:{}:{INSTANCE_CONTROL_PORT}", spec.ports.control),
            "--volume".into(),
            format!("{}:{INSTANCE_TUNNEL_DIR}", spec.tunnel_dir.display()),
            "--cap-add".into(),
            "NET_ADMIN".into(),
            "--device".into(),
            "/dev/net/tun".into(),
        ];
        for dns in DNS_SERVERS {
            args.push("--dns".into());
            args.push(dns.into());
        }
        if spec.credentials.is_some() {
            for name in ["VPN_USER", "VPN_PASS"] {
                args.push("--env".into());
                args.push(name.into());
            }
        }
        args.push(spec.image.clone());
        args.extend(INSTANCE_COMMAND.iter().map(|s| s.to_string()));
        args
    }

    async fn run(&self, op: &'static str, args: &[String], envs: &[(&str, &str)]) -> Result<String> {
        debug!(op, args = ?args.first(), "running docker");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in envs {
            cmd.env(key, value);
        }
        let output = cmd.output().await.map_err(|e| Error::InstanceLifecycle {
            op,
            detail: format!("failed to run {}: {e}", self.binary.display()),
        })?;

        if !output.status.success() {
            return Err(Error::InstanceLifecycle {
                op,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parse `docker ps` output, keeping only instances whose image is exactly
/// `image`. Images built on top of it are left alone.
fn parse_ps(stdout: &str, image: &str) -> Result<Vec<InstanceSummary>> {
    let mut instances = Vec::new();
    for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
        let ps: PsLine = serde_json::from_str(line).map_err(|e| Error::InstanceLifecycle {
            op: "list",
            detail: format!("unparseable docker ps line: {e}"),
        })?;
        if ps.image != image {
            continue;
        }
        instances.push(InstanceSummary {
            id: ps.id,
            name: ps.names,
            state: ps.state,
        });
    }
    Ok(instances)
}

impl InstanceRuntime for DockerCli {
    fn list_tagged<'a>(
        &'a self,
        image: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InstanceSummary>>> + Send + 'a>> {
        Box::pin(async move {
            let args = [
                "ps".to_string(),
                "--all".into(),
                "--no-trunc".into(),
                "--filter".into(),
                format!("label={SLOT_LABEL}"),
                "--format".into(),
                "{{json .}}".into(),
            ];
            let stdout = self.run("list", &args, &[]).await?;
            parse_ps(&stdout, image)
        })
    }

    fn create<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let args = Self::create_args(spec);
            let envs: Vec<(&str, &str)> = match &spec.credentials {
                Some(creds) => vec![
                    ("VPN_USER", creds.user.expose().as_str()),
                    ("VPN_PASS", creds.pass.expose().as_str()),
                ],
                None => Vec::new(),
            };
            self.run("create", &args, &envs).await
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.run("start", &["start".into(), id.into()], &[])
                .await
                .map(drop)
        })
    }

    fn stop<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.run("stop", &["stop".into(), id.into()], &[])
                .await
                .map(drop)
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.run("remove", &["rm".into(), "--force".into(), id.into()], &[])
                .await
                .map(drop)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(credentials: Option<VpnCredentials>) -> InstanceSpec {
        InstanceSpec {
            image: "vpnproxy".into(),
            name: "proxy-nordvpn-9001".into(),
            slot_key: "nordvpn-9001".into(),
            ports: PortPair {
                proxy: 9001,
                control: 3001,
            },
            tunnel_dir: PathBuf::from("/srv/ovpn"),
            credentials,
        }
    }

    fn pair(args: &[String], flag: &str) -> Vec<String> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].clone())
            .collect()
    }

    #[test]
    fn create_args_bind_ports_on_loopback() {
        let args = DockerCli::create_args(&spec(None));
        assert_eq!(args[0], "create");
        assert_eq!(
            pair(&args, "--publish"),
            vec!["127.0.0.1:9001:8118", "127.0.0.1:3001:3000"]
        );
        assert_eq!(pair(&args, "--volume"), vec!["/srv/ovpn:/ovpn"]);
        assert_eq!(pair(&args, "--dns"), vec!["8.8.8.8", "8.8.4.4"]);
        assert_eq!(pair(&args, "--cap-add"), vec!["NET_ADMIN"]);
        assert_eq!(pair(&args, "--device"), vec!["/dev/net/tun"]);
        assert_eq!(pair(&args, "--label"), vec!["vpn-proxy.slot=nordvpn-9001"]);
        assert_eq!(&args[args.len() - 3..], ["vpnproxy", "supervisord", "-n"]);
        assert!(pair(&args, "--env").is_empty());
    }

    #[test]
    fn credentials_never_appear_in_args() {
        let creds = VpnCredentials {
            user: Secret::new("alice".to_string()),
            pass: Secret::new("hunter2".to_string()),
        };
        let args = DockerCli::create_args(&spec(Some(creds)));
        assert_eq!(pair(&args, "--env"), vec!["VPN_USER", "VPN_PASS"]);
        assert!(!args.iter().any(|a| a.contains("alice") || a.contains("hunter2")));
    }

    #[test]
    fn parses_docker_ps_json_lines() {
        let stdout = r#"{"Command":"\"supervisord -n\"","ID":"abc123","Image":"vpnproxy","Names":"proxy-pia-9000","State":"running"}
{"ID":"def456","Image":"vpnproxy","Names":"proxy-pia-9001","State":"exited"}
"#;
        let instances = parse_ps(stdout, "vpnproxy").unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "abc123");
        assert_eq!(instances[1].name, "proxy-pia-9001");
        assert_eq!(instances[1].state, "exited");
    }

    #[test]
    fn empty_ps_output_is_no_instances() {
        assert!(parse_ps("", "vpnproxy").unwrap().is_empty());
    }

    #[test]
    fn derived_images_are_not_listed() {
        let stdout = r#"{"ID":"abc123","Image":"vpnproxy","Names":"proxy-pia-9000","State":"running"}
{"ID":"def456","Image":"vpnproxy-dev","Names":"proxy-dev-9000","State":"running"}
{"ID":"0a1b2c","Image":"registry.local/vpnproxy","Names":"other","State":"exited"}
"#;
        let instances = parse_ps(stdout, "vpnproxy").unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "abc123");
    }

    #[tokio::test]
    async fn stop_reports_failures_as_lifecycle_errors() {
        let docker = DockerCli::new("/nonexistent/docker");
        let err = docker.stop("abc").await.unwrap_err();
        assert!(matches!(err, Error::InstanceLifecycle { op: "stop", .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_lifecycle_error() {
        let docker = DockerCli::new("/nonexistent/docker");
        let err = docker.start("abc").await.unwrap_err();
        assert!(matches!(err, Error::InstanceLifecycle { op: "start", .. }));
    }
}
