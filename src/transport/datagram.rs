//! Connected datagram sockets
//!
//! [`DatagramDyn`] is the datagram counterpart of
//! [`StreamDyn`](super::StreamDyn): a socket already connected to a single
//! remote endpoint, usable from several tasks through `&self`.

use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// A datagram socket connected to one remote endpoint
#[async_trait]
pub trait DatagramDyn: Send + Sync + Debug {
    /// Send one datagram to the connected peer
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram from the connected peer
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Local address of the socket
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Remote address the socket is connected to
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramDyn for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::peer_addr(self)
    }
}
