//! smoltcp-backed userspace IP stack.
//!
//! [`SmolStack`] is a cheap handle to an event loop task that owns the
//! smoltcp interface. The stack has a single IPv4 NIC whose address is
//! the configured self IP; every packet it produces leaves through the
//! [`PacketLink`] it was started with.
//!
//! ```text
//! dial ──► StackRequest ──► EventLoop ──► smoltcp ──► PacketLink ──► tunnel
//!   ◄── VirtualTcpStream / VirtualUdpSocket ◄── channels ◄──┘
//! ```

mod datagram;
mod device;
mod event_loop;
mod iface;
mod stream;

pub use datagram::VirtualUdpSocket;
pub use stream::VirtualTcpStream;

use self::event_loop::{EventLoop, StackRequest, REQUEST_CHANNEL_SIZE};
use self::iface::StackCore;
use super::{FullAddress, NetStack, NetworkProtocol, NicId, PacketLink};
use crate::config::StackConfig;
use crate::error::StackError;
use crate::transport::{DatagramDyn, StreamDyn};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Handle to a running smoltcp stack.
pub struct SmolStack {
    nic: NicId,
    self_ip: Ipv4Addr,
    requests: mpsc::Sender<StackRequest>,
    task: JoinHandle<()>,
}

impl SmolStack {
    /// Build the interface and spawn its event loop. Must be called from
    /// within a tokio runtime.
    pub fn start(config: &StackConfig, link: PacketLink) -> Result<Self, StackError> {
        let core = StackCore::new(config)?;
        let (requests, requests_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let event_loop = EventLoop::new(
            core,
            link,
            requests_rx,
            Arc::new(Notify::new()),
            Duration::from_secs(config.connect_timeout),
        );
        let task = tokio::spawn(event_loop.run());

        info!(
            "Virtual stack up: {}/{} on {}",
            config.self_ip,
            config.prefix_len,
            NicId(config.nic_id)
        );

        Ok(SmolStack {
            nic: NicId(config.nic_id),
            self_ip: config.self_ip,
            requests,
            task,
        })
    }

    /// The NIC every endpoint of this stack belongs to.
    pub fn nic(&self) -> NicId {
        self.nic
    }

    /// Address of the NIC.
    pub fn self_ip(&self) -> Ipv4Addr {
        self.self_ip
    }

    /// Whether the event loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Map a bind/destination pair onto the stack's single IPv4 NIC.
    fn resolve_endpoints(
        &self,
        bind: FullAddress,
        dest: FullAddress,
        protocol: NetworkProtocol,
    ) -> Result<(SocketAddrV4, SocketAddrV4), StackError> {
        if protocol != NetworkProtocol::Ipv4 {
            return Err(StackError::UnsupportedAddress(format!(
                "network protocol {:?}",
                protocol
            )));
        }
        for endpoint in [&bind, &dest] {
            if endpoint.nic != self.nic {
                return Err(StackError::UnknownNic(endpoint.nic.0));
            }
        }

        let local_ip = match bind.addr {
            IpAddr::V4(ip) if ip == self.self_ip || ip.is_unspecified() => self.self_ip,
            IpAddr::V4(ip) => {
                return Err(StackError::Socket(format!(
                    "bind address {} is not assigned to {}",
                    ip, self.nic
                )))
            }
            IpAddr::V6(ip) => return Err(StackError::UnsupportedAddress(ip.to_string())),
        };
        let remote_ip = match dest.addr {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => return Err(StackError::UnsupportedAddress(ip.to_string())),
        };
        if dest.port == 0 {
            return Err(StackError::Socket(format!(
                "destination {} has no port",
                dest
            )));
        }

        Ok((
            SocketAddrV4::new(local_ip, bind.port),
            SocketAddrV4::new(remote_ip, dest.port),
        ))
    }
}

#[async_trait]
impl NetStack for SmolStack {
    async fn dial_tcp_with_bind(
        &self,
        ctx: &CancellationToken,
        bind: FullAddress,
        dest: FullAddress,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn StreamDyn>, StackError> {
        let (local, remote) = self.resolve_endpoints(bind, dest, protocol)?;
        if ctx.is_cancelled() {
            return Err(StackError::Cancelled);
        }

        let (response, response_rx) = oneshot::channel();
        self.requests
            .send(StackRequest::DialTcp {
                local,
                remote,
                response,
            })
            .await
            .map_err(|_| StackError::Shutdown)?;

        // dropping response_rx makes the loop abort the half-open socket
        let stream = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(StackError::Cancelled),
            result = response_rx => result.map_err(|_| StackError::Shutdown)??,
        };
        Ok(Box::new(stream))
    }

    async fn dial_udp(
        &self,
        bind: FullAddress,
        dest: FullAddress,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn DatagramDyn>, StackError> {
        let (local, remote) = self.resolve_endpoints(bind, dest, protocol)?;

        let (response, response_rx) = oneshot::channel();
        self.requests
            .send(StackRequest::DialUdp {
                local,
                remote,
                response,
            })
            .await
            .map_err(|_| StackError::Shutdown)?;

        let socket = response_rx.await.map_err(|_| StackError::Shutdown)??;
        Ok(Box::new(socket))
    }
}

impl std::fmt::Debug for SmolStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmolStack")
            .field("nic", &self.nic)
            .field("self_ip", &self.self_ip)
            .field("running", &self.is_running())
            .finish()
    }
}
