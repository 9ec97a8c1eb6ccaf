//! Client side of the control channel, used by the pool to drive instances.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::codec::JsonCodec;
use crate::error::{ControlError, Result};
use crate::protocol::{
    ControlCall, ControlRequest, ControlResponse, ControlResult, ExitInfo, InterfaceMap,
};

/// Remote control of one instance's tunnel.
///
/// Uses `Pin<Box<dyn Future>>` return types so pools can hold
/// `Arc<dyn TunnelControl>` and tests can substitute fakes.
pub trait TunnelControl: Send + Sync {
    /// Address of the controller, for logging.
    fn endpoint(&self) -> String;

    /// Start the tunnel; resolves to the egress address once established.
    fn connect<'a>(
        &'a self,
        vendor: &'a str,
        file: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    fn disconnect<'a>(
        &'a self,
        vendor: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<ExitInfo>> + Send + 'a>>;

    fn network_interfaces(&self)
    -> Pin<Box<dyn Future<Output = Result<InterfaceMap>> + Send + '_>>;
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Dial attempts before a call fails. Instances accept connections a
    /// little after their container starts.
    pub dial_attempts: u32,
    pub dial_backoff: Duration,
    /// Deadline for calls other than connect.
    pub call_timeout: Duration,
    /// Added to the tunnel timeout for the connect deadline, covering the
    /// controller's stop-and-reap on failure.
    pub connect_grace: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            dial_attempts: 10,
            dial_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
            connect_grace: Duration::from_secs(20),
        }
    }
}

struct Connection {
    reader: FramedRead<OwnedReadHalf, JsonCodec<ControlResponse>>,
    writer: FramedWrite<OwnedWriteHalf, JsonCodec<ControlRequest>>,
}

/// TCP control channel to one controller.
///
/// The connection is opened lazily and reused. Calls are serialized, so at
/// most one request is in flight. Any transport error, timeout, or protocol
/// violation drops the connection and the next call dials again.
pub struct ControlChannel {
    addr: SocketAddr,
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    settings: ChannelSettings,
}

impl ControlChannel {
    pub fn new(addr: SocketAddr, settings: ChannelSettings) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
            settings,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn dial(&self) -> Result<Connection> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match TcpStream::connect(self.addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    let (read_half, write_half) = stream.into_split();
                    return Ok(Connection {
                        reader: FramedRead::new(read_half, JsonCodec::new()),
                        writer: FramedWrite::new(write_half, JsonCodec::new()),
                    });
                }
                Err(e) if attempt < self.settings.dial_attempts => {
                    debug!(addr = %self.addr, attempt, error = %e, "control dial failed, retrying");
                    tokio::time::sleep(self.settings.dial_backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn call(&self, call: ControlCall, deadline: Duration) -> Result<ControlResult> {
        let method = call.method();
        let mut slot = self.conn.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let exchange = async {
            let mut conn = match slot.take() {
                Some(conn) => conn,
                None => self.dial().await?,
            };
            conn.writer.send(ControlRequest { id, call }).await?;
            let response = conn
                .reader
                .next()
                .await
                .ok_or(ControlError::ConnectionClosed)??;
            if response.id != id {
                return Err(ControlError::Protocol(format!(
                    "expected response {id}, got {}",
                    response.id
                )));
            }
            Ok((conn, response))
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok((conn, response))) => {
                *slot = Some(conn);
                debug!(addr = %self.addr, id, method, "control call answered");
                response.into_result()
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ControlError::CallTimeout),
        }
    }
}

fn unexpected(method: &str, result: ControlResult) -> ControlError {
    ControlError::Protocol(format!("unexpected result for {method}: {result:?}"))
}

impl TunnelControl for ControlChannel {
    fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    fn connect<'a>(
        &'a self,
        vendor: &'a str,
        file: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let call = ControlCall::Connect {
                vendor: vendor.to_owned(),
                file: file.to_owned(),
                timeout_secs: Some(timeout.as_secs().max(1)),
            };
            match self.call(call, timeout + self.settings.connect_grace).await? {
                ControlResult::Connected { egress } => Ok(egress),
                other => Err(unexpected("connect", other)),
            }
        })
    }

    fn disconnect<'a>(
        &'a self,
        vendor: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<ExitInfo>> + Send + 'a>> {
        Box::pin(async move {
            let call = ControlCall::Disconnect {
                vendor: vendor.map(str::to_owned),
            };
            match self.call(call, self.settings.call_timeout).await? {
                ControlResult::Disconnected { exit } => Ok(exit),
                other => Err(unexpected("disconnect", other)),
            }
        })
    }

    fn network_interfaces(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<InterfaceMap>> + Send + '_>> {
        Box::pin(async move {
            match self
                .call(ControlCall::GetNetworkInterfaces, self.settings.call_timeout)
                .await?
            {
                ControlResult::Interfaces { interfaces } => Ok(interfaces),
                other => Err(unexpected("get_network_interfaces", other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::serve;
    use crate::server::tests::{ESTABLISHING, controller};
    use tokio::net::TcpListener;

    fn fast_settings() -> ChannelSettings {
        ChannelSettings {
            dial_attempts: 2,
            dial_backoff: Duration::from_millis(10),
            call_timeout: Duration::from_millis(500),
            connect_grace: Duration::from_secs(5),
        }
    }

    async fn start_controller(script: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, controller(script), std::future::pending()));
        addr
    }

    #[tokio::test]
    async fn full_session_over_loopback() {
        let addr = start_controller(ESTABLISHING).await;
        let channel = ControlChannel::new(addr, fast_settings());

        let egress = channel
            .connect("nordvpn", "us1.ovpn", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(egress, "185.1.2.3");

        let err = channel
            .connect("nordvpn", "us2.ovpn", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::AlreadyConnected));

        let interfaces = channel.network_interfaces().await.unwrap();
        assert!(!interfaces.is_empty());

        let exit = channel.disconnect(Some("nordvpn")).await.unwrap();
        assert!(exit.signal.is_some() || exit.code.is_some());

        let err = channel.disconnect(None).await.unwrap_err();
        assert!(matches!(err, ControlError::NotConnected));
    }

    #[tokio::test]
    async fn connect_timeout_crosses_the_wire() {
        let addr = start_controller("exec sleep 30").await;
        let channel = ControlChannel::new(addr, fast_settings());

        let err = channel
            .connect("nordvpn", "us1.ovpn", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::ConnectTimeout { secs: 1 }));
    }

    #[tokio::test]
    async fn unreachable_controller_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = ControlChannel::new(addr, fast_settings());
        let err = channel.network_interfaces().await.unwrap_err();
        assert!(matches!(err, ControlError::Transport(_)));
    }

    #[tokio::test]
    async fn silent_controller_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let channel = ControlChannel::new(addr, fast_settings());
        let err = channel.network_interfaces().await.unwrap_err();
        assert!(matches!(err, ControlError::CallTimeout));
    }

    #[tokio::test]
    async fn mismatched_response_id_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut reader = FramedRead::new(read_half, JsonCodec::<ControlRequest>::new());
            let mut writer = FramedWrite::new(write_half, JsonCodec::<ControlResponse>::new());
            let request = reader.next().await.unwrap().unwrap();
            let reply = ControlResponse::ok(
                request.id + 100,
                ControlResult::Disconnected {
                    exit: ExitInfo::default(),
                },
            );
            writer.send(reply).await.unwrap();
            std::future::pending::<()>().await;
        });

        let channel = ControlChannel::new(addr, fast_settings());
        let err = channel.disconnect(None).await.unwrap_err();
        assert!(matches!(err, ControlError::Protocol(_)));
    }
}
