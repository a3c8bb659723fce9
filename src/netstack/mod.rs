//! Virtual IP stack interface.
//!
//! The routing dialer only ever talks to a userspace stack through the
//! [`NetStack`] trait: a bound TCP dial and a UDP bind+connect, both
//! described with [`FullAddress`] endpoints. [`SmolStack`] is the
//! smoltcp-backed implementation shipped with the crate; packets leave
//! and enter it through a [`PacketLink`].

pub mod link;
pub mod smol;

pub use link::PacketLink;
pub use smol::SmolStack;

use crate::error::StackError;
use crate::transport::{DatagramDyn, StreamDyn};
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio_util::sync::CancellationToken;

/// Identifier of a network interface inside the virtual stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NicId(pub u32);

impl fmt::Display for NicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nic{}", self.0)
    }
}

/// Network-layer protocol selector passed with every dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NetworkProtocol {
    /// IPv4 (EtherType 0x0800)
    Ipv4 = 0x0800,
    /// IPv6 (EtherType 0x86DD)
    Ipv6 = 0x86DD,
}

/// An endpoint inside the virtual stack: interface, address and port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullAddress {
    /// Interface the endpoint belongs to
    pub nic: NicId,
    /// IP address
    pub addr: IpAddr,
    /// Port, 0 meaning "any"
    pub port: u16,
}

impl FullAddress {
    /// Create a new endpoint
    pub fn new(nic: NicId, addr: IpAddr, port: u16) -> Self {
        FullAddress { nic, addr, port }
    }

    /// The address/port pair without the interface
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl fmt::Display for FullAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.socket_addr(), self.nic)
    }
}

/// Dial and bind primitives of a userspace IP stack.
///
/// Implementations are shared between all sessions behind an `Arc` and
/// must be safe to call concurrently.
#[async_trait]
pub trait NetStack: Send + Sync + fmt::Debug {
    /// Open a TCP connection whose local side is bound to `bind` (port 0
    /// picks an ephemeral port) and whose remote side is `dest`.
    ///
    /// Returns once the handshake completes. Cancelling `ctx` aborts the
    /// half-open socket and returns [`StackError::Cancelled`].
    async fn dial_tcp_with_bind(
        &self,
        ctx: &CancellationToken,
        bind: FullAddress,
        dest: FullAddress,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn StreamDyn>, StackError>;

    /// Bind a UDP socket to `bind` and connect it to `dest`.
    async fn dial_udp(
        &self,
        bind: FullAddress,
        dest: FullAddress,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn DatagramDyn>, StackError>;
}
