//! SOCKS5 UDP relay

mod associate;
mod packet;

pub use associate::handle_udp_associate;
pub use packet::{encode_udp_packet, parse_udp_packet, UdpPacket};
