//! Transport module for Socksroute
//!
//! Connection handles handed back by dialers, and the socket options
//! applied to host TCP connections.

mod datagram;

pub use datagram::DatagramDyn;

use crate::config::DirectConfig;
use std::fmt::{self, Debug};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Create socket options from the direct dial config
    pub fn from_direct_config(config: &DirectConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs).filter(|s| *s > 0),
            keepalive_interval: Some(config.keepalive_interval).filter(|s| *s > 0),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Dynamic stream trait for boxed streams
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Debug> StreamDyn for T {}

/// A live connection returned by a dialer.
///
/// Ownership moves to the caller; dropping it closes the underlying
/// socket, whichever stack it lives on.
pub enum Connection {
    /// Bidirectional byte stream
    Stream {
        /// The stream itself
        stream: Box<dyn StreamDyn>,
        /// Local address of the outbound socket, when known
        local_addr: Option<SocketAddr>,
    },
    /// Connected datagram socket
    Datagram(Box<dyn DatagramDyn>),
}

impl Connection {
    /// Wrap a stream with a known local address
    pub fn stream<S: StreamDyn + 'static>(stream: S, local_addr: Option<SocketAddr>) -> Self {
        Connection::Stream {
            stream: Box::new(stream),
            local_addr,
        }
    }

    /// Wrap a connected datagram socket
    pub fn datagram<D: DatagramDyn + 'static>(socket: D) -> Self {
        Connection::Datagram(Box::new(socket))
    }

    /// Local address of the outbound side, if known
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Stream { local_addr, .. } => *local_addr,
            Connection::Datagram(socket) => socket.local_addr().ok(),
        }
    }

    /// Whether this is a stream connection
    pub fn is_stream(&self) -> bool {
        matches!(self, Connection::Stream { .. })
    }

    /// Whether this is a datagram connection
    pub fn is_datagram(&self) -> bool {
        matches!(self, Connection::Datagram(_))
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Stream { stream, local_addr } => f
                .debug_struct("Stream")
                .field("stream", stream)
                .field("local_addr", local_addr)
                .finish(),
            Connection::Datagram(socket) => f.debug_tuple("Datagram").field(socket).finish(),
        }
    }
}
