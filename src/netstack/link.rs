//! Packet link between the virtual stack and the outside world.
//!
//! A [`PacketLink`] is the stack's only way out: raw IP packets produced
//! by smoltcp are written to it, and packets read from it are injected
//! into the virtual device. Two flavours exist:
//!
//! - [`PacketLink::channel`]: in-memory, for embedding the stack behind an
//!   arbitrary tunnel (and for tests).
//! - [`PacketLink::udp`]: a host UDP socket carrying one IP packet per
//!   datagram to a tunnel peer.

use crate::config::LinkConfig;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the packet channels in each direction.
pub const LINK_CHANNEL_CAPACITY: usize = 1024;

/// Size of the UDP receive buffer.
const UDP_BUF_SIZE: usize = 65536;

/// Stack-side end of a packet link.
#[derive(Debug)]
pub struct PacketLink {
    /// Packets arriving for the stack.
    pub(crate) inbound: mpsc::Receiver<Bytes>,
    /// Packets leaving the stack.
    pub(crate) outbound: mpsc::Sender<Bytes>,
    /// Pump tasks owned by the link, aborted on drop.
    tasks: Vec<JoinHandle<()>>,
}

/// Far end of an in-memory packet link.
#[derive(Debug)]
pub struct PacketLinkPeer {
    /// Inject packets into the stack.
    pub to_stack: mpsc::Sender<Bytes>,
    /// Packets emitted by the stack.
    pub from_stack: mpsc::Receiver<Bytes>,
}

impl PacketLink {
    /// Create an in-memory link and its far end.
    pub fn channel(capacity: usize) -> (PacketLink, PacketLinkPeer) {
        let (to_stack, inbound) = mpsc::channel(capacity);
        let (outbound, from_stack) = mpsc::channel(capacity);

        let link = PacketLink {
            inbound,
            outbound,
            tasks: Vec::new(),
        };
        let peer = PacketLinkPeer {
            to_stack,
            from_stack,
        };
        (link, peer)
    }

    /// Create a link that exchanges packets with a UDP tunnel peer.
    pub async fn udp(config: &LinkConfig) -> Result<PacketLink> {
        let socket = UdpSocket::bind(&config.local_addr)
            .await
            .with_context(|| format!("Failed to bind packet link socket {}", config.local_addr))?;
        socket
            .connect(&config.peer_addr)
            .await
            .with_context(|| format!("Failed to connect packet link to {}", config.peer_addr))?;
        info!(
            "Packet link bound on {} -> peer {}",
            socket.local_addr()?,
            config.peer_addr
        );

        let socket = Arc::new(socket);
        let (to_stack, inbound) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (outbound, mut from_stack) = mpsc::channel::<Bytes>(LINK_CHANNEL_CAPACITY);

        let rx_socket = socket.clone();
        let rx_task = tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUF_SIZE];
            loop {
                match rx_socket.recv(&mut buf).await {
                    Ok(n) => {
                        if to_stack.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            debug!("Virtual stack gone, stopping link receiver");
                            break;
                        }
                    }
                    Err(e) => warn!("Packet link recv error: {}", e),
                }
            }
        });

        let tx_task = tokio::spawn(async move {
            while let Some(packet) = from_stack.recv().await {
                if let Err(e) = socket.send(&packet).await {
                    warn!("Packet link send error: {}", e);
                }
            }
            debug!("Virtual stack gone, stopping link sender");
        });

        Ok(PacketLink {
            inbound,
            outbound,
            tasks: vec![rx_task, tx_task],
        })
    }
}

impl Drop for PacketLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
