//! SOCKS5 UDP request header
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```

use crate::socks::consts::*;
use crate::socks::types::TargetAddr;
use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};

/// One encapsulated datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    /// Fragment number, zero for standalone datagrams
    pub frag: u8,
    /// Destination on the way out, source on the way back
    pub addr: TargetAddr,
    /// Payload
    pub data: Bytes,
}

impl UdpPacket {
    /// Standalone datagram
    pub fn new(addr: TargetAddr, data: Bytes) -> Self {
        UdpPacket {
            frag: 0,
            addr,
            data,
        }
    }

    /// Whether this datagram is part of a fragment sequence
    pub fn is_fragmented(&self) -> bool {
        self.frag != 0
    }
}

/// Parse an encapsulated datagram
pub fn parse_udp_packet(data: &[u8]) -> Result<UdpPacket> {
    if data.len() < 4 {
        bail!("UDP packet too short: {} bytes", data.len());
    }

    let mut buf = data;

    let rsv = buf.get_u16();
    if rsv != 0 {
        bail!("Invalid RSV field: {}", rsv);
    }
    let frag = buf.get_u8();
    let atyp = buf.get_u8();

    let addr = match atyp {
        SOCKS5_ADDR_TYPE_IPV4 => {
            if buf.remaining() < 6 {
                bail!("Buffer too short for IPv4 address");
            }
            let ip = Ipv4Addr::from(buf.get_u32());
            TargetAddr::ipv4(ip, buf.get_u16())
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            if buf.is_empty() {
                bail!("Buffer too short for domain length");
            }
            let len = buf.get_u8() as usize;
            if len == 0 || buf.remaining() < len + 2 {
                bail!("Buffer too short for domain name");
            }
            let domain = String::from_utf8(buf[..len].to_vec())
                .with_context(|| "Invalid UTF-8 in domain")?;
            buf.advance(len);
            TargetAddr::domain(domain, buf.get_u16())
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            if buf.remaining() < 18 {
                bail!("Buffer too short for IPv6 address");
            }
            let ip = Ipv6Addr::from(buf.get_u128());
            TargetAddr::ipv6(ip, buf.get_u16())
        }

        _ => bail!("Unknown address type: {}", atyp),
    };

    Ok(UdpPacket {
        frag,
        addr,
        data: Bytes::copy_from_slice(buf),
    })
}

/// Encode a datagram with its header
pub fn encode_udp_packet(packet: &UdpPacket) -> Bytes {
    let addr = packet.addr.to_bytes();
    let mut buf = BytesMut::with_capacity(3 + addr.len() + packet.data.len());
    buf.put_u16(0);
    buf.put_u8(packet.frag);
    buf.extend_from_slice(&addr);
    buf.extend_from_slice(&packet.data);
    buf.freeze()
}
