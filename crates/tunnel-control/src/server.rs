//! Controller side of the control channel.
//!
//! Runs inside an egress instance. Owns at most one tunnel process and
//! drives it through the [`state`](crate::state) machine. [`serve`] exposes
//! the controller over TCP with the length-prefixed JSON framing.

use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::codec::JsonCodec;
use crate::error::{ControlError, Result};
use crate::protocol::{
    AddressFamily, ControlCall, ControlRequest, ControlResponse, ControlResult, ExitInfo,
    InterfaceAddress, InterfaceMap,
};
use crate::scanner::EstablishmentScanner;
use crate::state::{TunnelAction, TunnelEvent, TunnelState, handle_event};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the command that starts one tunnel.
pub trait TunnelLauncher: Send + Sync {
    fn command(&self, vendor: &str, file: &str) -> Result<Command>;
}

/// Launches `<binary> <file>` from `<root>/<vendor>`.
#[derive(Debug, Clone)]
pub struct OpenVpnLauncher {
    binary: PathBuf,
    root: PathBuf,
}

impl OpenVpnLauncher {
    pub fn new(binary: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            root: root.into(),
        }
    }
}

impl TunnelLauncher for OpenVpnLauncher {
    fn command(&self, vendor: &str, file: &str) -> Result<Command> {
        check_component("vendor", vendor)?;
        check_component("file", file)?;

        let dir = self.root.join(vendor);
        if !dir.join(file).is_file() {
            return Err(ControlError::InvalidRequest(format!(
                "no tunnel file {file} for vendor {vendor}"
            )));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.arg(file).current_dir(dir);
        Ok(cmd)
    }
}

/// Reject anything that is not a single plain path component.
fn check_component(what: &str, value: &str) -> Result<()> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(ControlError::InvalidRequest(format!(
            "{what} must be a plain name, got {value:?}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Used when a connect call carries no timeout.
    pub connect_timeout: Duration,
    /// How long a tunnel gets to exit after SIGINT before it is killed.
    pub stop_grace: Duration,
    /// How long to wait for exit after SIGKILL.
    pub kill_grace: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stop_grace: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stop {
    Interrupt,
    Kill,
}

#[derive(Debug)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Handle to the running tunnel process. The process itself is owned by
/// its pump task.
struct TunnelProcess {
    stop_tx: mpsc::UnboundedSender<Stop>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl TunnelProcess {
    fn handles(&self) -> (mpsc::UnboundedSender<Stop>, watch::Receiver<Option<ExitInfo>>) {
        (self.stop_tx.clone(), self.exit_rx.clone())
    }
}

struct Inner {
    state: TunnelState,
    /// Bumped on every spawn so tasks of a previous process cannot clobber
    /// the state of the current one.
    generation: u64,
    process: Option<TunnelProcess>,
}

enum Outcome {
    Established(String),
    Failed(ControlError),
}

pub struct Controller {
    inner: Mutex<Inner>,
    launcher: Arc<dyn TunnelLauncher>,
    scanner: EstablishmentScanner,
    settings: ControllerSettings,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state())
            .field("pattern", &self.scanner.pattern())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(
        launcher: Arc<dyn TunnelLauncher>,
        scanner: EstablishmentScanner,
        settings: ControllerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: TunnelState::Idle,
                generation: 0,
                process: None,
            }),
            launcher,
            scanner,
            settings,
        })
    }

    pub fn state(&self) -> TunnelState {
        self.lock().state.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Execute one decoded request.
    pub async fn dispatch(self: &Arc<Self>, request: ControlRequest) -> ControlResponse {
        let id = request.id;
        let method = request.call.method();
        let outcome = match request.call {
            ControlCall::Connect {
                vendor,
                file,
                timeout_secs,
            } => match timeout_secs {
                Some(0) => Err(ControlError::InvalidRequest(
                    "timeout_secs must be positive".into(),
                )),
                secs => {
                    let timeout = secs
                        .map(Duration::from_secs)
                        .unwrap_or(self.settings.connect_timeout);
                    self.connect(&vendor, &file, timeout)
                        .await
                        .map(|egress| ControlResult::Connected { egress })
                }
            },
            ControlCall::Disconnect { vendor } => self
                .disconnect(vendor.as_deref())
                .await
                .map(|exit| ControlResult::Disconnected { exit }),
            ControlCall::GetNetworkInterfaces => {
                local_interfaces().map(|interfaces| ControlResult::Interfaces { interfaces })
            }
        };

        match outcome {
            Ok(result) => ControlResponse::ok(id, result),
            Err(e) => {
                debug!(id, method, error = %e, "control call failed");
                ControlResponse::fault(id, &e)
            }
        }
    }

    /// Start the tunnel for `vendor/file` and wait for it to come up.
    ///
    /// Returns the egress address announced by the tunnel. On any failure
    /// the process is stopped and the controller is back in `Idle` before
    /// this returns.
    pub async fn connect(
        self: &Arc<Self>,
        vendor: &str,
        file: &str,
        timeout: Duration,
    ) -> Result<String> {
        let (generation, mut lines, mut exit_rx) = {
            let mut inner = self.lock();
            let (state, action) = handle_event(inner.state.clone(), TunnelEvent::ConnectRequested);
            match action {
                TunnelAction::Spawn => {}
                TunnelAction::Reject(e) => return Err(e),
                other => {
                    return Err(ControlError::Internal(format!(
                        "unexpected action on connect: {other:?}"
                    )));
                }
            }

            // Nothing started on error, so the state stays Idle.
            let (child, lines) = self.launcher.command(vendor, file).and_then(spawn_tunnel)?;

            inner.state = state;
            inner.generation += 1;
            let generation = inner.generation;

            let (stop_tx, stop_rx) = mpsc::unbounded_channel();
            let (exit_tx, exit_rx) = watch::channel(None);
            tokio::spawn(pump(child, stop_rx, exit_tx));
            inner.process = Some(TunnelProcess {
                stop_tx,
                exit_rx: exit_rx.clone(),
            });
            self.spawn_exit_monitor(generation, exit_rx.clone());
            (generation, lines, exit_rx)
        };

        info!(vendor, file, generation, "tunnel process started");

        let outcome = tokio::time::timeout(
            timeout,
            wait_established(&self.scanner, &mut lines, &mut exit_rx),
        )
        .await
        .unwrap_or(Outcome::Failed(ControlError::ConnectTimeout {
            secs: timeout.as_secs(),
        }));

        match outcome {
            Outcome::Established(egress) => {
                let mut inner = self.lock();
                if inner.generation != generation {
                    return Err(ControlError::Tunnel(
                        "tunnel replaced while connecting".into(),
                    ));
                }
                let (state, _) = handle_event(
                    inner.state.clone(),
                    TunnelEvent::Established {
                        egress: egress.clone(),
                    },
                );
                if !matches!(state, TunnelState::Connected { .. }) {
                    return Err(ControlError::Tunnel(
                        "tunnel stopped while connecting".into(),
                    ));
                }
                inner.state = state;
                drop(inner);

                info!(vendor, file, egress = %egress, "tunnel established");
                tokio::spawn(drain_output(lines));
                Ok(egress)
            }
            Outcome::Failed(err) => {
                warn!(vendor, file, error = %err, "tunnel failed to establish");
                let handles = {
                    let mut inner = self.lock();
                    if inner.generation == generation {
                        let (state, action) =
                            handle_event(inner.state.clone(), TunnelEvent::ConnectFailed);
                        inner.state = state;
                        match action {
                            TunnelAction::Kill => inner.process.as_ref().map(TunnelProcess::handles),
                            _ => None,
                        }
                    } else {
                        None
                    }
                };
                if let Some((stop_tx, exit_rx)) = handles {
                    self.stop_process(generation, stop_tx, exit_rx).await;
                }
                Err(err)
            }
        }
    }

    /// Stop the running tunnel and report how it exited.
    pub async fn disconnect(self: &Arc<Self>, vendor: Option<&str>) -> Result<ExitInfo> {
        let (generation, stop_tx, exit_rx) = {
            let mut inner = self.lock();
            let (state, action) =
                handle_event(inner.state.clone(), TunnelEvent::DisconnectRequested);
            match action {
                TunnelAction::Kill => {}
                TunnelAction::Reject(e) => return Err(e),
                other => {
                    return Err(ControlError::Internal(format!(
                        "unexpected action on disconnect: {other:?}"
                    )));
                }
            }
            let Some((stop_tx, exit_rx)) = inner.process.as_ref().map(TunnelProcess::handles)
            else {
                inner.state = TunnelState::Idle;
                return Err(ControlError::NotConnected);
            };
            inner.state = state;
            (inner.generation, stop_tx, exit_rx)
        };

        info!(vendor = vendor.unwrap_or("-"), generation, "stopping tunnel");
        self.stop_process(generation, stop_tx, exit_rx)
            .await
            .ok_or_else(|| ControlError::Internal("tunnel process did not exit".into()))
    }

    /// SIGINT, then SIGKILL after the grace period. Returns the exit once
    /// observed and moves the controller back to `Idle`.
    async fn stop_process(
        &self,
        generation: u64,
        stop_tx: mpsc::UnboundedSender<Stop>,
        mut exit_rx: watch::Receiver<Option<ExitInfo>>,
    ) -> Option<ExitInfo> {
        let _ = stop_tx.send(Stop::Interrupt);
        let mut exit = wait_exit(&mut exit_rx, self.settings.stop_grace).await;
        if exit.is_none() {
            warn!(generation, "tunnel ignored SIGINT, killing");
            let _ = stop_tx.send(Stop::Kill);
            exit = wait_exit(&mut exit_rx, self.settings.kill_grace).await;
        }
        if exit.is_some() {
            self.mark_exited(generation);
        }
        exit
    }

    fn spawn_exit_monitor(
        self: &Arc<Self>,
        generation: u64,
        mut exit_rx: watch::Receiver<Option<ExitInfo>>,
    ) {
        let controller = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = exit_rx.wait_for(Option::is_some).await.ok().and_then(|e| *e);
            if let Some(controller) = controller.upgrade() {
                info!(generation, ?exit, "tunnel process exited");
                controller.mark_exited(generation);
            }
        });
    }

    fn mark_exited(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        let (state, _) = handle_event(inner.state.clone(), TunnelEvent::Exited);
        inner.state = state;
        inner.process = None;
    }
}

fn spawn_tunnel(mut cmd: Command) -> Result<(Child, mpsc::UnboundedReceiver<OutputLine>)> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|e| ControlError::Spawn(e.to_string()))?;

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone(), OutputLine::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx, OutputLine::Stderr));
    }
    Ok((child, rx))
}

async fn forward_lines<R>(
    reader: R,
    tx: mpsc::UnboundedSender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(wrap(line)).is_err() {
            break;
        }
    }
}

/// Owns the child: delivers stop requests and publishes the exit.
async fn pump(
    mut child: Child,
    mut stop_rx: mpsc::UnboundedReceiver<Stop>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    loop {
        tokio::select! {
            status = child.wait() => {
                let exit = match status {
                    Ok(status) => ExitInfo::from(status),
                    Err(e) => {
                        warn!(error = %e, "failed to reap tunnel process");
                        ExitInfo::default()
                    }
                };
                let _ = exit_tx.send(Some(exit));
                return;
            }
            Some(stop) = stop_rx.recv() => {
                let delivered = match stop {
                    Stop::Interrupt => interrupt(&mut child),
                    Stop::Kill => child.start_kill(),
                };
                if let Err(e) = delivered {
                    warn!(?stop, error = %e, "failed to signal tunnel process");
                }
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(io::Error::from),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

async fn wait_established(
    scanner: &EstablishmentScanner,
    lines: &mut mpsc::UnboundedReceiver<OutputLine>,
    exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
) -> Outcome {
    let mut output_open = true;
    loop {
        tokio::select! {
            biased;
            line = lines.recv(), if output_open => match line {
                Some(OutputLine::Stdout(line)) => {
                    debug!(line = %line, "tunnel stdout");
                    if let Some(egress) = scanner.scan(&line) {
                        return Outcome::Established(egress);
                    }
                }
                Some(OutputLine::Stderr(line)) => {
                    return Outcome::Failed(ControlError::Tunnel(line));
                }
                None => output_open = false,
            },
            exit = exit_rx.wait_for(Option::is_some), if !output_open => {
                let exit = exit.ok().and_then(|e| *e).unwrap_or_default();
                return Outcome::Failed(ControlError::Tunnel(format!(
                    "tunnel exited before establishing (code {:?}, signal {:?})",
                    exit.code, exit.signal
                )));
            }
        }
    }
}

async fn wait_exit(
    exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    within: Duration,
) -> Option<ExitInfo> {
    match tokio::time::timeout(within, exit_rx.wait_for(Option::is_some)).await {
        Ok(Ok(exit)) => *exit,
        // Pump gone without publishing: treat as exited.
        Ok(Err(_)) => Some(ExitInfo::default()),
        Err(_) => None,
    }
}

async fn drain_output(mut lines: mpsc::UnboundedReceiver<OutputLine>) {
    while let Some(line) = lines.recv().await {
        match line {
            OutputLine::Stdout(line) => debug!(line = %line, "tunnel stdout"),
            OutputLine::Stderr(line) => warn!(line = %line, "tunnel stderr"),
        }
    }
}

/// Addresses of every local network interface.
#[cfg(unix)]
pub fn local_interfaces() -> Result<InterfaceMap> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| ControlError::Internal(format!("getifaddrs: {e}")))?;

    let mut map = InterfaceMap::new();
    for ifaddr in addrs {
        let entry = map.entry(ifaddr.interface_name.clone()).or_default();
        let Some(address) = ifaddr.address else {
            continue;
        };
        let netmask = ifaddr.netmask;
        if let Some(v4) = address.as_sockaddr_in() {
            entry.push(InterfaceAddress {
                address: v4.ip().into(),
                family: AddressFamily::IPv4,
                netmask: netmask
                    .as_ref()
                    .and_then(|m| m.as_sockaddr_in())
                    .map(|m| m.ip().into()),
            });
        } else if let Some(v6) = address.as_sockaddr_in6() {
            entry.push(InterfaceAddress {
                address: v6.ip().into(),
                family: AddressFamily::IPv6,
                netmask: netmask
                    .as_ref()
                    .and_then(|m| m.as_sockaddr_in6())
                    .map(|m| m.ip().into()),
            });
        }
    }
    Ok(map)
}

#[cfg(not(unix))]
pub fn local_interfaces() -> Result<InterfaceMap> {
    Err(ControlError::Internal(
        "interface enumeration is only supported on unix".into(),
    ))
}

/// Accept control connections until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    controller: Arc<Controller>,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("control listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept control connection");
                        continue;
                    }
                };
                debug!(%peer, "control connection accepted");
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, controller).await {
                        debug!(%peer, error = %e, "control connection ended with error");
                    }
                });
            }
        }
    }
}

/// Requests on one connection are answered strictly in order.
async fn handle_connection(stream: TcpStream, controller: Arc<Controller>) -> io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<ControlRequest>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<ControlResponse>::new());

    while let Some(frame) = reader.next().await {
        let request = frame?;
        debug!(id = request.id, method = request.call.method(), "control request");
        let response = controller.dispatch(request).await;
        writer.send(response).await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Runs `sh -c <script>` regardless of vendor/file.
    pub(crate) struct ScriptLauncher(pub &'static str);

    impl TunnelLauncher for ScriptLauncher {
        fn command(&self, _vendor: &str, _file: &str) -> Result<Command> {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(self.0);
            Ok(cmd)
        }
    }

    pub(crate) const ESTABLISHING: &str =
        "echo 'ip route add 185.1.2.3/32 via 172.17.0.1'; exec sleep 30";

    pub(crate) fn controller(script: &'static str) -> Arc<Controller> {
        Controller::new(
            Arc::new(ScriptLauncher(script)),
            EstablishmentScanner::default(),
            ControllerSettings {
                connect_timeout: Duration::from_secs(5),
                stop_grace: Duration::from_secs(2),
                kill_grace: Duration::from_secs(2),
            },
        )
    }

    #[tokio::test]
    async fn connect_reports_egress_and_rejects_second_connect() {
        let ctl = controller(ESTABLISHING);

        let egress = ctl
            .connect("nordvpn", "us1.ovpn", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(egress, "185.1.2.3");
        assert_eq!(ctl.state().label(), "connected");

        let err = ctl
            .connect("nordvpn", "us2.ovpn", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::AlreadyConnected));
        assert_eq!(ctl.lock().generation, 1, "second connect must not spawn");

        let exit = ctl.disconnect(Some("nordvpn")).await.unwrap();
        #[cfg(unix)]
        assert_eq!(exit.signal, Some(2));
        assert_eq!(ctl.state(), TunnelState::Idle);
    }

    #[tokio::test]
    async fn egress_skips_default_route_lines() {
        let ctl = controller(
            "echo 'ip route add 0.0.0.0/1 via 10.8.0.1'; \
             echo 'ip route add default via 10.8.0.1'; \
             echo 'ip route add 185.9.8.7/32 via 172.17.0.1'; exec sleep 30",
        );

        let egress = ctl
            .connect("nordvpn", "us1.ovpn", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(egress, "185.9.8.7");
        ctl.disconnect(None).await.unwrap();
    }

    #[test]
    fn debug_output_names_state() {
        let ctl = controller(ESTABLISHING);
        let rendered = format!("{ctl:?}");
        assert!(rendered.starts_with("Controller {"), "{rendered}");
        assert!(rendered.contains("Idle"), "{rendered}");
    }

    #[tokio::test]
    async fn silent_tunnel_times_out_and_is_stopped() {
        let ctl = controller("exec sleep 30");

        let err = ctl
            .connect("nordvpn", "us1.ovpn", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::ConnectTimeout { secs: 1 }));
        assert_eq!(ctl.state(), TunnelState::Idle);
        assert!(ctl.lock().process.is_none());
    }

    #[tokio::test]
    async fn stderr_output_fails_connect() {
        let ctl = controller("echo AUTH_FAILED >&2; exec sleep 30");

        let err = ctl
            .connect("nordvpn", "us1.ovpn", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ControlError::Tunnel(msg) => assert_eq!(msg, "AUTH_FAILED"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(ctl.state(), TunnelState::Idle);
    }

    #[tokio::test]
    async fn early_exit_fails_connect() {
        let ctl = controller("exit 3");

        let err = ctl
            .connect("nordvpn", "us1.ovpn", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Tunnel(_)));

        // The exit monitor settles the state shortly after.
        for _ in 0..50 {
            if ctl.state() == TunnelState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ctl.state(), TunnelState::Idle);
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_rejected() {
        let ctl = controller(ESTABLISHING);
        let err = ctl.disconnect(None).await.unwrap_err();
        assert!(matches!(err, ControlError::NotConnected));
    }

    #[tokio::test]
    async fn reconnect_after_disconnect() {
        let ctl = controller(ESTABLISHING);
        ctl.connect("pia", "a.ovpn", Duration::from_secs(5))
            .await
            .unwrap();
        ctl.disconnect(None).await.unwrap();
        ctl.connect("pia", "b.ovpn", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ctl.lock().generation, 2);
        ctl.disconnect(None).await.unwrap();
    }

    #[tokio::test]
    async fn zero_timeout_is_invalid() {
        let ctl = controller(ESTABLISHING);
        let resp = ctl
            .dispatch(ControlRequest {
                id: 11,
                call: ControlCall::Connect {
                    vendor: "pia".into(),
                    file: "a.ovpn".into(),
                    timeout_secs: Some(0),
                },
            })
            .await;
        assert_eq!(resp.id, 11);
        assert!(matches!(
            resp.into_result(),
            Err(ControlError::InvalidRequest(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn loopback_is_listed() {
        let interfaces = local_interfaces().unwrap();
        let lo = interfaces
            .iter()
            .find(|(_, addrs)| addrs.iter().any(|a| a.address.is_loopback()));
        assert!(lo.is_some(), "no loopback address in {interfaces:?}");
    }

    #[test]
    fn launcher_rejects_path_traversal() {
        let launcher = OpenVpnLauncher::new("openvpn", "/ovpn");
        let cases = [
            ("..", "x.ovpn"),
            ("nordvpn", "../etc/passwd"),
            ("a/b", "x.ovpn"),
            ("nordvpn", ""),
        ];
        for (vendor, file) in cases {
            let err = launcher.command(vendor, file).unwrap_err();
            assert!(matches!(err, ControlError::InvalidRequest(_)), "{vendor}/{file}");
        }
    }

    #[test]
    fn launcher_rejects_missing_file() {
        let launcher = OpenVpnLauncher::new("openvpn", "/nonexistent-tunnel-root");
        let err = launcher.command("nordvpn", "us1.ovpn").unwrap_err();
        assert!(matches!(err, ControlError::InvalidRequest(_)));
    }
}
