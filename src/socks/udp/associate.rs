//! UDP ASSOCIATE
//!
//! The endpoint binds a relay socket next to the control connection and
//! reports it to the client. Every distinct destination the client sends
//! to becomes a flow: a task that dials its own `udp` connection, drains a
//! bounded send queue into it and returns replies through the relay socket
//! with the destination as their source header. Flows close after
//! `udp_idle_timeout` seconds of silence. The association lives exactly as
//! long as the control connection.

use super::packet::{encode_udp_packet, parse_udp_packet, UdpPacket};
use crate::dialer::Network;
use crate::error::{DialError, Socks5ReplyCode};
use crate::socks::command::{build_reply, send_dial_error, send_success};
use crate::socks::consts::MAX_UDP_PACKET;
use crate::socks::handler::Session;
use crate::socks::types::TargetAddr;
use crate::transport::{Connection, DatagramDyn};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, trace, warn};

/// Maximum number of concurrent flows in one association
const MAX_UDP_FLOWS: usize = 64;

/// Datagrams queued per flow while it dials or sends
const UDP_QUEUE_SIZE: usize = 256;

/// Relay state for one association
struct UdpAssociation {
    relay: Arc<UdpSocket>,
    client: Option<SocketAddr>,
    flows: HashMap<TargetAddr, mpsc::Sender<Bytes>>,
    tasks: JoinSet<TargetAddr>,
    idle_timeout: Duration,
    opened: usize,
}

impl UdpAssociation {
    fn new(relay: Arc<UdpSocket>, idle_timeout: Duration) -> Self {
        UdpAssociation {
            relay,
            client: None,
            flows: HashMap::new(),
            tasks: JoinSet::new(),
            idle_timeout,
            opened: 0,
        }
    }

    /// Route one datagram arriving on the relay socket to its flow.
    /// Never waits: a full queue drops the datagram.
    fn handle_client_datagram(&mut self, session: &Session, data: &[u8], from: SocketAddr) {
        match self.client {
            None => {
                debug!("UDP association bound to client {}", from);
                self.client = Some(from);
            }
            Some(client) if client != from => {
                trace!("Dropping UDP datagram from stranger {}", from);
                return;
            }
            Some(_) => {}
        }

        let packet = match parse_udp_packet(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Invalid SOCKS5 UDP packet: {}", e);
                return;
            }
        };

        if packet.is_fragmented() {
            warn!("Fragmented UDP packets not supported, dropping");
            return;
        }

        let data = match self.flows.get(&packet.addr) {
            Some(queue) => match queue.try_send(packet.data) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    trace!("UDP flow to {} congested, dropping datagram", packet.addr);
                    return;
                }
                Err(TrySendError::Closed(data)) => data,
            },
            None => packet.data,
        };
        self.flows.remove(&packet.addr);

        if self.flows.len() >= MAX_UDP_FLOWS {
            warn!(
                "UDP association has {} flows, dropping datagram to {}",
                MAX_UDP_FLOWS, packet.addr
            );
            return;
        }

        let (queue, queue_rx) = mpsc::channel(UDP_QUEUE_SIZE);
        // a fresh queue always has room
        let _ = queue.try_send(data);
        self.flows.insert(packet.addr.clone(), queue);
        self.opened += 1;
        self.tasks.spawn(run_flow(
            session.clone(),
            packet.addr,
            queue_rx,
            self.relay.clone(),
            from,
            self.idle_timeout,
        ));
    }

    /// Forget a finished flow unless a newer one already took its place
    fn flow_finished(&mut self, finished: std::result::Result<TargetAddr, JoinError>) {
        match finished {
            Ok(target) => {
                if self.flows.get(&target).is_some_and(|queue| queue.is_closed()) {
                    self.flows.remove(&target);
                }
            }
            Err(e) => debug!("UDP flow task failed: {}", e),
        }
    }
}

/// Dial `target` and relay in both directions until the flow goes idle,
/// its reply path fails or the association drops its queue.
async fn run_flow(
    session: Session,
    target: TargetAddr,
    mut queue: mpsc::Receiver<Bytes>,
    relay: Arc<UdpSocket>,
    client: SocketAddr,
    idle_timeout: Duration,
) -> TargetAddr {
    let Some(socket) = open_flow(&session, &target).await else {
        return target;
    };
    debug!("UDP flow opened to {}", target);

    let mut buf = vec![0u8; MAX_UDP_PACKET];
    loop {
        tokio::select! {
            data = queue.recv() => match data {
                Some(data) => match socket.send(&data).await {
                    Ok(n) => trace!("UDP relay: sent {} bytes to {}", n, target),
                    Err(e) => warn!("UDP send to {} failed: {}", target, e),
                },
                None => break,
            },
            received = socket.recv(&mut buf) => {
                let n = match received {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("UDP flow from {} ended: {}", target, e);
                        break;
                    }
                };
                let packet = UdpPacket::new(target.clone(), Bytes::copy_from_slice(&buf[..n]));
                if let Err(e) = relay.send_to(&encode_udp_packet(&packet), client).await {
                    debug!("UDP reply to {} failed: {}", client, e);
                    break;
                }
                trace!("UDP relay: {} bytes from {} to {}", n, target, client);
            }
            _ = tokio::time::sleep(idle_timeout) => {
                debug!("UDP flow to {} idle for {:?}, closing", target, idle_timeout);
                break;
            }
        }
    }
    target
}

/// Resolve and dial one destination through the session's dialer
async fn open_flow(session: &Session, target: &TargetAddr) -> Option<Box<dyn DatagramDyn>> {
    let resolved = match session.prepare_target(target).await {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!("Failed to resolve UDP target {}: {:#}", target, e);
            return None;
        }
    };

    match session.dial(&Network::Udp, &resolved).await {
        Ok(Connection::Datagram(socket)) => Some(socket),
        Ok(Connection::Stream { .. }) => {
            warn!("Dialer returned a stream for UDP target {}", target);
            None
        }
        Err(e) => {
            warn!("Failed to open UDP flow to {}: {}", target, e);
            None
        }
    }
}

/// Serve a UDP ASSOCIATE request on the control stream.
///
/// `requested` is the client's announced source, which is only logged;
/// the first datagram received fixes the client address.
pub async fn handle_udp_associate<S>(session: &Session, mut control: S, requested: TargetAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let relay_ip = session.local_addr().ip();
    let relay = match UdpSocket::bind((relay_ip, 0)).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            let err = DialError::from(e);
            send_dial_error(&mut control, &err).await?;
            return Err(err).with_context(|| format!("Failed to bind UDP relay on {}", relay_ip));
        }
    };
    let relay_addr = match relay.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            build_reply(&mut control, Socks5ReplyCode::GeneralFailure, None).await?;
            return Err(e).context("UDP relay has no local address");
        }
    };

    send_success(&mut control, Some(relay_addr)).await?;
    info!(
        "UDP relay listening on {} (client announced {})",
        relay_addr, requested
    );

    let idle_timeout = Duration::from_secs(session.config().udp_idle_timeout);
    let mut association = UdpAssociation::new(relay.clone(), idle_timeout);
    let mut control_buf = [0u8; 512];
    let mut recv_buf = vec![0u8; MAX_UDP_PACKET];

    loop {
        tokio::select! {
            _ = session.ctx().cancelled() => {
                debug!("UDP association cancelled");
                break;
            }
            read = control.read(&mut control_buf) => match read {
                Ok(0) => {
                    debug!("Control connection closed, ending UDP association");
                    break;
                }
                Ok(n) => trace!("Ignoring {} bytes on UDP control connection", n),
                Err(e) => {
                    debug!("Control connection error: {}", e);
                    break;
                }
            },
            received = relay.recv_from(&mut recv_buf) => match received {
                Ok((n, from)) => association.handle_client_datagram(session, &recv_buf[..n], from),
                Err(e) => warn!("UDP relay receive failed: {}", e),
            },
            Some(finished) = association.tasks.join_next(), if !association.tasks.is_empty() => {
                association.flow_finished(finished);
            }
        }
    }

    association.tasks.shutdown().await;
    info!("UDP association closed after {} flows", association.opened);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocksConfig;
    use crate::dialer::Dialer;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};
    use tokio_util::sync::CancellationToken;

    /// Dials UDP flows to a local echo server, except for ports that hang
    #[derive(Debug)]
    struct FlowDialer {
        echo: SocketAddr,
        hangs: fn(u16) -> bool,
        calls: Mutex<Vec<String>>,
    }

    impl FlowDialer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dialer for FlowDialer {
        async fn dial(
            &self,
            ctx: &CancellationToken,
            _network: &Network,
            addr: &str,
        ) -> std::result::Result<Connection, DialError> {
            self.calls.lock().unwrap().push(addr.to_string());
            let port = addr
                .rsplit(':')
                .next()
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            if (self.hangs)(port) {
                ctx.cancelled().await;
                return Err(DialError::Cancelled);
            }

            let socket = UdpSocket::bind("127.0.0.1:0").await?;
            socket.connect(self.echo).await?;
            Ok(Connection::datagram(socket))
        }
    }

    async fn spawn_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    async fn associate(
        hangs: fn(u16) -> bool,
        config: SocksConfig,
    ) -> (Arc<FlowDialer>, DuplexStream, SocketAddr) {
        let dialer = Arc::new(FlowDialer {
            echo: spawn_echo().await,
            hangs,
            calls: Mutex::new(Vec::new()),
        });
        let session = Session::new(
            Arc::new(config),
            dialer.clone(),
            CancellationToken::new(),
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:1080".parse().unwrap(),
        );

        let (mut control, server) = duplex(1024);
        tokio::spawn(async move {
            let requested = TargetAddr::ipv4(Ipv4Addr::UNSPECIFIED, 0);
            handle_udp_associate(&session, server, requested).await
        });

        let mut reply = [0u8; 10];
        control.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);
        let relay = SocketAddr::from(([127, 0, 0, 1], u16::from_be_bytes([reply[8], reply[9]])));
        (dialer, control, relay)
    }

    fn datagram(port: u16, payload: &'static [u8]) -> Bytes {
        let target = TargetAddr::ipv4(Ipv4Addr::new(10, 0, 0, 5), port);
        encode_udp_packet(&UdpPacket::new(target, Bytes::from_static(payload)))
    }

    async fn expect_reply(client: &UdpSocket, within: Duration) -> UdpPacket {
        let mut buf = vec![0u8; 2048];
        let (n, _) = tokio::time::timeout(within, client.recv_from(&mut buf))
            .await
            .expect("no reply in time")
            .unwrap();
        parse_udp_packet(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_slow_dial_does_not_stall_other_flows() {
        let config = SocksConfig {
            request_timeout: 30,
            ..Default::default()
        };
        let (dialer, _control, relay) = associate(|port| port == 9, config).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(&datagram(9, b"stuck"), relay).await.unwrap();
        client.send_to(&datagram(53, b"query"), relay).await.unwrap();

        let reply = expect_reply(&client, Duration::from_secs(2)).await;
        assert_eq!(reply.addr, TargetAddr::ipv4(Ipv4Addr::new(10, 0, 0, 5), 53));
        assert_eq!(&reply.data[..], b"query");
        let mut calls = dialer.calls();
        calls.sort();
        assert_eq!(calls, vec!["10.0.0.5:53", "10.0.0.5:9"]);
    }

    #[tokio::test]
    async fn test_flow_count_is_capped() {
        let config = SocksConfig {
            request_timeout: 30,
            ..Default::default()
        };
        let (dialer, _control, relay) = associate(|_| true, config).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        for port in 1..=(MAX_UDP_FLOWS as u16 + 8) {
            client.send_to(&datagram(port, b"x"), relay).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(dialer.calls().len(), MAX_UDP_FLOWS);
    }

    #[tokio::test]
    async fn test_idle_flow_is_closed_and_reopened() {
        let config = SocksConfig {
            udp_idle_timeout: 1,
            ..Default::default()
        };
        let (dialer, _control, relay) = associate(|_| false, config).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(&datagram(53, b"first"), relay).await.unwrap();
        expect_reply(&client, Duration::from_secs(2)).await;
        client.send_to(&datagram(53, b"again"), relay).await.unwrap();
        expect_reply(&client, Duration::from_secs(2)).await;
        assert_eq!(dialer.calls().len(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        client.send_to(&datagram(53, b"later"), relay).await.unwrap();
        let reply = expect_reply(&client, Duration::from_secs(2)).await;
        assert_eq!(&reply.data[..], b"later");
        assert_eq!(dialer.calls().len(), 2);
    }
}
