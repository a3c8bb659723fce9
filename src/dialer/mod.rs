//! Dialers for Socksroute
//!
//! The SOCKS5 layer only ever reaches the network through a [`Dialer`].
//! Two implementations exist:
//!
//! - [`DirectDialer`]: the host network stack.
//! - [`RoutingDialer`]: decides per request between the host stack and a
//!   userspace [`NetStack`](crate::netstack::NetStack).

mod classify;
mod direct;
mod router;

pub use classify::{classify, AddressFamily, Classification, HostForm};
pub use direct::DirectDialer;
pub use router::{DirectReason, ProxiedRoute, ProxiedTransport, RoutingDecision, RoutingDialer};

use crate::error::DialError;
use crate::transport::Connection;
use async_trait::async_trait;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Transport requested for a dial, named the way Go's `net.Dial` names
/// networks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Network {
    /// Stream, any address family
    Tcp,
    /// Stream, IPv4 only
    Tcp4,
    /// Stream, IPv6 only
    Tcp6,
    /// Datagram, any address family
    Udp,
    /// Datagram, IPv4 only
    Udp4,
    /// Datagram, IPv6 only
    Udp6,
    /// Anything else
    Other(String),
}

impl Network {
    /// The network name as a string
    pub fn as_str(&self) -> &str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Other(name) => name,
        }
    }

    /// Whether this is one of the stream networks
    pub fn is_stream(&self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }

    /// Whether this is one of the datagram networks
    pub fn is_datagram(&self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }
}

impl From<&str> for Network {
    fn from(name: &str) -> Self {
        match name {
            "tcp" => Network::Tcp,
            "tcp4" => Network::Tcp4,
            "tcp6" => Network::Tcp6,
            "udp" => Network::Udp,
            "udp4" => Network::Udp4,
            "udp6" => Network::Udp6,
            other => Network::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dial capability handed to the SOCKS5 endpoint.
///
/// `addr` is a textual `host:port`. Implementations must be shareable
/// between sessions; the returned connection belongs to the caller.
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    /// Open a connection to `addr` over `network`, giving up when `ctx`
    /// is cancelled
    async fn dial(
        &self,
        ctx: &CancellationToken,
        network: &Network,
        addr: &str,
    ) -> Result<Connection, DialError>;
}
