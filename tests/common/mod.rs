//! Test utilities and fakes for Socksroute
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use socksroute::config::{Config, DirectConfig, LinkConfig, SocksConfig, StackConfig};
use socksroute::dialer::{DirectDialer, RoutingDialer};
use socksroute::error::StackError;
use socksroute::netstack::{FullAddress, NetStack, NetworkProtocol, NicId};
use socksroute::socks::Socks5Server;
use socksroute::transport::{DatagramDyn, StreamDyn};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

/// Self address used by every test stack
pub const SELF_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// NIC id used by every test stack
pub const NIC: NicId = NicId(1);

/// Create a pair of connected duplex streams for testing
pub fn create_mock_stream_pair() -> (DuplexStream, DuplexStream) {
    duplex(8192)
}

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Spawn a TCP server echoing every connection back
pub async fn spawn_tcp_echo() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Spawn a UDP server echoing every datagram back to its sender
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// A dial observed by [`RecordingStack`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCall {
    /// `dial_tcp_with_bind`
    Tcp {
        /// Bind endpoint
        bind: FullAddress,
        /// Destination endpoint
        dest: FullAddress,
    },
    /// `dial_udp`
    Udp {
        /// Bind endpoint
        bind: FullAddress,
        /// Destination endpoint
        dest: FullAddress,
    },
}

/// Virtual stack fake: records every dial and serves echo connections.
///
/// TCP dials return an in-memory stream echoing what is written to it.
/// UDP dials return a host socket connected to a local UDP echo server,
/// whatever the requested destination.
#[derive(Debug, Default)]
pub struct RecordingStack {
    calls: Mutex<Vec<StackCall>>,
    udp_echo: Mutex<Option<SocketAddr>>,
}

impl RecordingStack {
    /// Create a fake stack
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingStack::default())
    }

    /// Serve UDP dials from this echo server
    pub fn with_udp_echo(self: Arc<Self>, echo: SocketAddr) -> Arc<Self> {
        *self.udp_echo.lock().unwrap() = Some(echo);
        self
    }

    /// Dials seen so far
    pub fn calls(&self) -> Vec<StackCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetStack for RecordingStack {
    async fn dial_tcp_with_bind(
        &self,
        ctx: &CancellationToken,
        bind: FullAddress,
        dest: FullAddress,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn StreamDyn>, StackError> {
        assert_eq!(protocol, NetworkProtocol::Ipv4);
        self.calls.lock().unwrap().push(StackCall::Tcp { bind, dest });
        if ctx.is_cancelled() {
            return Err(StackError::Cancelled);
        }

        let (near, mut far) = duplex(8192);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok(n) = far.read(&mut buf).await {
                if n == 0 || far.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        Ok(Box::new(near))
    }

    async fn dial_udp(
        &self,
        bind: FullAddress,
        dest: FullAddress,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn DatagramDyn>, StackError> {
        assert_eq!(protocol, NetworkProtocol::Ipv4);
        self.calls.lock().unwrap().push(StackCall::Udp { bind, dest });

        let echo = self
            .udp_echo
            .lock()
            .unwrap()
            .ok_or_else(|| StackError::Socket("no UDP echo configured".to_string()))?;
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .map_err(|e| StackError::Socket(e.to_string()))?;
        socket
            .connect(echo)
            .await
            .map_err(|e| StackError::Socket(e.to_string()))?;
        Ok(Box::new(socket))
    }
}

/// Routing dialer over a fake stack
pub fn routing_dialer(stack: Arc<RecordingStack>) -> RoutingDialer {
    RoutingDialer::new(stack, SELF_IP, NIC, DirectDialer::default())
}

/// Start a SOCKS5 endpoint over a routing dialer and the given fake stack
pub async fn start_endpoint(
    stack: Arc<RecordingStack>,
    config: SocksConfig,
) -> (Arc<Socks5Server>, SocketAddr) {
    let (listener, addr) = create_test_listener().await;
    let server = Arc::new(Socks5Server::new(config, Arc::new(routing_dialer(stack))));
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await });
    }
    (server, addr)
}

/// Connect a plain TCP client to the endpoint
pub async fn connect_client(endpoint: SocketAddr) -> TcpStream {
    TcpStream::connect(endpoint).await.unwrap()
}

/// Test configuration builder
pub struct TestConfigBuilder {
    listen_addr: String,
    self_ip: Ipv4Addr,
    nic_id: u32,
    auth_required: bool,
    allow_udp: bool,
    dns_resolve: bool,
    request_timeout: u64,
    udp_idle_timeout: u64,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            listen_addr: "127.0.0.1:0".to_string(),
            self_ip: SELF_IP,
            nic_id: NIC.0,
            auth_required: false,
            allow_udp: true,
            dns_resolve: false,
            request_timeout: 5,
            udp_idle_timeout: 120,
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the self IP of the virtual stack
    pub fn self_ip(mut self, ip: Ipv4Addr) -> Self {
        self.self_ip = ip;
        self
    }

    /// Set the NIC id
    pub fn nic_id(mut self, nic_id: u32) -> Self {
        self.nic_id = nic_id;
        self
    }

    /// Set authentication required
    pub fn auth_required(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    /// Allow UDP
    pub fn allow_udp(mut self, allow: bool) -> Self {
        self.allow_udp = allow;
        self
    }

    /// Resolve domains before dialing
    pub fn dns_resolve(mut self, resolve: bool) -> Self {
        self.dns_resolve = resolve;
        self
    }

    /// Dial timeout in seconds
    pub fn request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout = secs;
        self
    }

    /// UDP flow idle timeout in seconds
    pub fn udp_idle_timeout(mut self, secs: u64) -> Self {
        self.udp_idle_timeout = secs;
        self
    }

    /// Build only the SOCKS5 section
    pub fn socks(&self) -> SocksConfig {
        SocksConfig {
            listen_addr: self.listen_addr.clone(),
            auth_required: self.auth_required,
            username: self.auth_required.then(|| "testuser".to_string()),
            password: self.auth_required.then(|| "testpass".to_string()),
            allow_udp: self.allow_udp,
            dns_resolve: self.dns_resolve,
            request_timeout: self.request_timeout,
            udp_idle_timeout: self.udp_idle_timeout,
        }
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        let link = LinkConfig {
            local_addr: "127.0.0.1:0".to_string(),
            peer_addr: "127.0.0.1:9".to_string(),
        };
        let mut stack = StackConfig::new(self.self_ip, link);
        stack.nic_id = self.nic_id;

        Config {
            socks: self.socks(),
            stack,
            direct: DirectConfig::default(),
        }
    }
}

/// Raw SOCKS5 client messages
pub mod socks5_mock {
    use socksroute::socks::consts::*;

    /// No-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// UDP ASSOCIATE request announcing `0.0.0.0:0`
    pub fn create_udp_associate() -> Vec<u8> {
        vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_UDP_ASSOCIATE,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ]
    }

    /// CONNECT request to an IPv4 address
    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
        ];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_mock_stream_pair() {
        let (mut a, mut b) = create_mock_stream_pair();

        a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_config_builder() {
        let config = TestConfigBuilder::new()
            .self_ip(Ipv4Addr::new(172, 16, 0, 9))
            .nic_id(3)
            .auth_required(true)
            .allow_udp(false)
            .build();

        assert_eq!(config.stack.self_ip, Ipv4Addr::new(172, 16, 0, 9));
        assert_eq!(config.stack.nic_id, 3);
        assert!(config.socks.auth_required);
        assert_eq!(config.socks.username.as_deref(), Some("testuser"));
        assert!(!config.socks.allow_udp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_socks5_mock_connect_ipv4() {
        let cmd = socks5_mock::create_connect_ipv4([192, 168, 1, 1], 8080);
        assert_eq!(cmd[0], 5);
        assert_eq!(cmd[1], 1);
        assert_eq!(cmd[3], 1);
        assert_eq!(&cmd[4..8], &[192, 168, 1, 1]);
    }
}
