//! Connected UDP socket inside the virtual stack.

use crate::transport::DatagramDyn;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// Channel capacity in each direction.
const DATAGRAM_CHANNEL_CAPACITY: usize = 64;

/// Largest payload accepted by [`VirtualUdpSocket::send`].
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Event-loop ends of a UDP socket's channels.
#[derive(Debug)]
pub struct DatagramChannels {
    /// Datagrams from the connected peer, towards the socket.
    pub inbound_tx: mpsc::Sender<Bytes>,
    /// Datagrams written by the socket.
    pub outbound_rx: mpsc::Receiver<Bytes>,
}

/// A UDP socket bound in the virtual stack and connected to one peer.
///
/// Only datagrams whose source is the connected peer are delivered.
pub struct VirtualUdpSocket {
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    wake: Arc<Notify>,
}

impl VirtualUdpSocket {
    /// Create a socket and the channel ends the event loop keeps.
    pub fn new_pair(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        wake: Arc<Notify>,
    ) -> (Self, DatagramChannels) {
        let (inbound_tx, inbound) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let (outbound, outbound_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);

        let socket = VirtualUdpSocket {
            outbound,
            inbound: Mutex::new(inbound),
            local_addr,
            peer_addr,
            wake,
        };
        let channels = DatagramChannels {
            inbound_tx,
            outbound_rx,
        };
        (socket, channels)
    }
}

#[async_trait]
impl DatagramDyn for VirtualUdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes is too large", buf.len()),
            ));
        }
        self.outbound
            .send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "virtual stack closed the socket"))?;
        self.wake.notify_one();
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(data) => {
                // truncated like a host socket would
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                self.wake.notify_one();
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "virtual stack closed the socket",
            )),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer_addr)
    }
}

impl Drop for VirtualUdpSocket {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

impl fmt::Debug for VirtualUdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualUdpSocket")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
