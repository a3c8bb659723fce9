//! Direct dials through the host network stack.

use super::{Dialer, Network};
use crate::error::DialError;
use crate::transport::{Connection, SocketOpts};
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Address families a network name admits
#[derive(Debug, Clone, Copy)]
enum FamilyFilter {
    Any,
    V4,
    V6,
}

impl FamilyFilter {
    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            FamilyFilter::Any => true,
            FamilyFilter::V4 => addr.is_ipv4(),
            FamilyFilter::V6 => addr.is_ipv6(),
        }
    }
}

/// Dialer using the host's ordinary TCP/UDP sockets.
#[derive(Debug, Clone, Default)]
pub struct DirectDialer {
    opts: SocketOpts,
}

impl DirectDialer {
    /// Create a direct dialer applying `opts` to every TCP connection
    pub fn new(opts: SocketOpts) -> Self {
        DirectDialer { opts }
    }

    async fn resolve(addr: &str, filter: FamilyFilter) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = lookup_host(addr)
            .await?
            .filter(|a| filter.admits(a))
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no suitable address found for {}", addr),
            ));
        }
        Ok(addrs)
    }

    async fn dial_tcp(&self, addr: &str, filter: FamilyFilter) -> io::Result<Connection> {
        let mut last_err = None;
        for candidate in Self::resolve(addr, filter).await? {
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    self.opts.apply(&stream)?;
                    let local = stream.local_addr().ok();
                    debug!("Direct TCP connected to {} from {:?}", candidate, local);
                    return Ok(Connection::stream(stream, local));
                }
                Err(e) => {
                    debug!("Direct TCP connect to {} failed: {}", candidate, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
    }

    async fn dial_udp(&self, addr: &str, filter: FamilyFilter) -> io::Result<Connection> {
        let remote = Self::resolve(addr, filter).await?[0];
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        debug!(
            "Direct UDP socket {} connected to {}",
            socket.local_addr()?,
            remote
        );
        Ok(Connection::datagram(socket))
    }

    async fn dial_network(&self, network: &Network, addr: &str) -> io::Result<Connection> {
        match network {
            Network::Tcp => self.dial_tcp(addr, FamilyFilter::Any).await,
            Network::Tcp4 => self.dial_tcp(addr, FamilyFilter::V4).await,
            Network::Tcp6 => self.dial_tcp(addr, FamilyFilter::V6).await,
            Network::Udp => self.dial_udp(addr, FamilyFilter::Any).await,
            Network::Udp4 => self.dial_udp(addr, FamilyFilter::V4).await,
            Network::Udp6 => self.dial_udp(addr, FamilyFilter::V6).await,
            Network::Other(name) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unknown network {}", name),
            )),
        }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(
        &self,
        ctx: &CancellationToken,
        network: &Network,
        addr: &str,
    ) -> Result<Connection, DialError> {
        info!("{} -> DIRECT", addr);

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(DialError::Cancelled),
            result = self.dial_network(network, addr) => result.map_err(DialError::from),
        }
    }
}
