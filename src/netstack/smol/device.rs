//! In-memory packet device for smoltcp.
//!
//! Implements the smoltcp [`Device`] trait over two packet queues. The
//! event loop fills `rx_queue` from the [`PacketLink`](crate::netstack::PacketLink)
//! and drains `tx_queue` back into it after every poll. `Medium::Ip`
//! means the queues hold bare IP packets, no Ethernet framing.

use bytes::Bytes;
use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use std::collections::VecDeque;

/// A packet device backed by in-memory queues.
pub struct PacketDevice {
    /// Packets waiting to be received by smoltcp.
    rx_queue: VecDeque<Bytes>,
    /// Packets produced by smoltcp.
    tx_queue: VecDeque<Bytes>,
    /// Maximum transmission unit.
    mtu: usize,
}

impl PacketDevice {
    /// Create a new device with the given MTU.
    pub fn new(mtu: usize) -> Self {
        Self {
            rx_queue: VecDeque::with_capacity(64),
            tx_queue: VecDeque::with_capacity(64),
            mtu,
        }
    }

    /// Queue an IP packet for smoltcp to receive on the next poll.
    pub fn inject_rx(&mut self, packet: Bytes) {
        self.rx_queue.push_back(packet);
    }

    /// Drain all packets smoltcp produced.
    pub fn drain_tx(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.tx_queue.drain(..)
    }
}

impl Device for PacketDevice {
    type RxToken<'a> = PacketRxToken;
    type TxToken<'a> = PacketTxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let buffer = self.rx_queue.pop_front()?;
        let rx = PacketRxToken { buffer };
        let tx = PacketTxToken {
            tx_queue: &mut self.tx_queue,
        };
        Some((rx, tx))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(PacketTxToken {
            tx_queue: &mut self.tx_queue,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps.checksum = ChecksumCapabilities::default();
        caps.checksum.ipv4 = Checksum::Both;
        caps.checksum.tcp = Checksum::Both;
        caps.checksum.udp = Checksum::Both;
        caps
    }
}

/// Receive token owning one inbound IP packet.
pub struct PacketRxToken {
    buffer: Bytes,
}

impl smoltcp::phy::RxToken for PacketRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.buffer)
    }
}

/// Transmit token appending the produced packet to the TX queue.
pub struct PacketTxToken<'a> {
    tx_queue: &'a mut VecDeque<Bytes>,
}

impl<'a> smoltcp::phy::TxToken for PacketTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.tx_queue.push_back(Bytes::from(buffer));
        result
    }
}

impl std::fmt::Debug for PacketDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDevice")
            .field("mtu", &self.mtu)
            .field("rx_queue_len", &self.rx_queue.len())
            .field("tx_queue_len", &self.tx_queue.len())
            .finish()
    }
}
