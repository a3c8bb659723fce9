//! SOCKS5 endpoint
//!
//! Accepts RFC 1928 clients, negotiates no-auth or RFC 1929
//! username/password, and hands every CONNECT and UDP ASSOCIATE
//! destination to a [`Dialer`](crate::dialer::Dialer). The endpoint itself
//! never opens an outbound socket.

mod auth;
mod command;
pub mod consts;
mod handler;
mod relay;
mod server;
mod types;
mod udp;

pub use auth::{authenticate, AuthMethod, PasswordAuth};
pub use command::{build_reply, encode_reply, parse_command, ParsedRequest, RequestRejection};
pub use handler::Session;
pub use relay::relay_tcp;
pub use server::Socks5Server;
pub use types::{SocksCommand, TargetAddr};
pub use udp::{encode_udp_packet, handle_udp_associate, parse_udp_packet, UdpPacket};
