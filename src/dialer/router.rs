//! The routing dialer.
//!
//! Every request ends in exactly one of two places: the host network
//! stack, or the virtual stack bound to this process's self address.
//! Only a literal IPv4 host over plain `tcp` or `udp` takes the virtual
//! stack; every ambiguous or unsupported case falls back to the host
//! stack rather than failing. The one hard error is a target whose port
//! cannot be parsed.

use super::classify::{classify, Classification, HostForm};
use super::{Dialer, DirectDialer, Network};
use crate::error::DialError;
use crate::netstack::{FullAddress, NetStack, NetworkProtocol, NicId};
use crate::transport::Connection;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why a request is dialled through the host stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectReason {
    /// Multi-colon target, or an IPv6 literal host
    Ipv6,
    /// Host is not an IP literal; resolution was skipped upstream
    OpaqueHost(String),
    /// The virtual stack only serves `tcp` and `udp`
    UnsupportedNetwork(String),
}

/// Transport used on the virtual stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxiedTransport {
    /// Bound TCP dial
    Stream,
    /// UDP bind and connect
    Datagram,
}

/// Endpoints of a proxied dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedRoute {
    /// Stream or datagram
    pub transport: ProxiedTransport,
    /// Local endpoint inside the virtual stack
    pub bind: FullAddress,
    /// Remote endpoint
    pub destination: FullAddress,
}

/// Outcome of routing one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Dial through the host network stack
    Direct(DirectReason),
    /// Dial through the virtual stack
    Proxied(ProxiedRoute),
}

/// Dialer choosing per request between the host stack and a [`NetStack`].
#[derive(Debug, Clone)]
pub struct RoutingDialer {
    stack: Arc<dyn NetStack>,
    nic: NicId,
    bind: FullAddress,
    direct: DirectDialer,
}

impl RoutingDialer {
    /// Create a routing dialer whose proxied dials bind to `self_ip` on
    /// `nic`. The bind endpoint is fixed for the dialer's lifetime.
    pub fn new(stack: Arc<dyn NetStack>, self_ip: Ipv4Addr, nic: NicId, direct: DirectDialer) -> Self {
        RoutingDialer {
            stack,
            nic,
            bind: FullAddress::new(nic, IpAddr::V4(self_ip), 0),
            direct,
        }
    }

    /// The local endpoint every proxied dial binds to
    pub fn bind_endpoint(&self) -> FullAddress {
        self.bind
    }

    /// Decide where a request goes without dialing anything.
    pub fn decide(&self, network: &Network, addr: &str) -> Result<RoutingDecision, DialError> {
        let (host, port) = match classify(addr)? {
            Classification::Ipv6 => return Ok(RoutingDecision::Direct(DirectReason::Ipv6)),
            Classification::Ipv4 { host, port } => (host, port),
        };

        let ip = match host {
            HostForm::Literal(IpAddr::V4(ip)) => ip,
            HostForm::Literal(IpAddr::V6(_)) => {
                return Ok(RoutingDecision::Direct(DirectReason::Ipv6))
            }
            HostForm::Opaque(host) => {
                return Ok(RoutingDecision::Direct(DirectReason::OpaqueHost(host)))
            }
        };

        let transport = match network {
            Network::Tcp => ProxiedTransport::Stream,
            Network::Udp => ProxiedTransport::Datagram,
            other => {
                return Ok(RoutingDecision::Direct(DirectReason::UnsupportedNetwork(
                    other.to_string(),
                )))
            }
        };

        Ok(RoutingDecision::Proxied(ProxiedRoute {
            transport,
            bind: self.bind,
            destination: FullAddress::new(self.nic, IpAddr::V4(ip), port),
        }))
    }
}

#[async_trait]
impl Dialer for RoutingDialer {
    async fn dial(
        &self,
        ctx: &CancellationToken,
        network: &Network,
        addr: &str,
    ) -> Result<Connection, DialError> {
        match self.decide(network, addr)? {
            RoutingDecision::Direct(reason) => {
                match &reason {
                    DirectReason::Ipv6 => {}
                    DirectReason::OpaqueHost(host) => {
                        warn!("Illegal situation, host is not pure IP format: {}", host)
                    }
                    DirectReason::UnsupportedNetwork(network) => warn!(
                        "Proxy only supports TCP/UDP, {} over {} will use a direct connection",
                        addr, network
                    ),
                }
                self.direct.dial(ctx, network, addr).await
            }
            RoutingDecision::Proxied(route) => match route.transport {
                ProxiedTransport::Stream => {
                    info!("[TCP]: {} -> PROXY", addr);
                    let stream = self
                        .stack
                        .dial_tcp_with_bind(ctx, route.bind, route.destination, NetworkProtocol::Ipv4)
                        .await?;
                    Ok(Connection::Stream {
                        stream,
                        local_addr: None,
                    })
                }
                ProxiedTransport::Datagram => {
                    info!("[UDP]: {} -> PROXY", addr);
                    let socket = self
                        .stack
                        .dial_udp(route.bind, route.destination, NetworkProtocol::Ipv4)
                        .await?;
                    Ok(Connection::Datagram(socket))
                }
            },
        }
    }
}
