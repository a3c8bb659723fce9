//! SOCKS5 request types

use super::consts::*;
use anyhow::{Context, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    /// TCP CONNECT
    Connect,
    /// TCP BIND
    Bind,
    /// UDP ASSOCIATE
    UdpAssociate,
}

impl SocksCommand {
    /// Parse a command byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Some(SocksCommand::Connect),
            SOCKS5_CMD_TCP_BIND => Some(SocksCommand::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(SocksCommand::UdpAssociate),
            _ => None,
        }
    }

    /// Wire byte for this command
    pub fn to_byte(self) -> u8 {
        match self {
            SocksCommand::Connect => SOCKS5_CMD_TCP_CONNECT,
            SocksCommand::Bind => SOCKS5_CMD_TCP_BIND,
            SocksCommand::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }
}

impl fmt::Display for SocksCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksCommand::Connect => write!(f, "CONNECT"),
            SocksCommand::Bind => write!(f, "BIND"),
            SocksCommand::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// Destination of a SOCKS5 request.
///
/// The `Display` form is the textual `host:port` handed to dialers;
/// IPv6 hosts are bracketed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl TargetAddr {
    /// IPv4 target
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// IPv6 target
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port))
    }

    /// Domain target
    pub fn domain(domain: String, port: u16) -> Self {
        TargetAddr::Domain(domain, port)
    }

    /// Port number
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Whether the target still needs name resolution
    pub fn is_domain(&self) -> bool {
        matches!(self, TargetAddr::Domain(..))
    }

    /// Resolve to a socket address, preferring IPv4 answers.
    ///
    /// IP targets return immediately.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(domain, port) => {
                let addrs: Vec<SocketAddr> = tokio::net::lookup_host((domain.as_str(), *port))
                    .await
                    .with_context(|| format!("Failed to resolve domain: {}", domain))?
                    .collect();
                addrs
                    .iter()
                    .find(|a| a.is_ipv4())
                    .or_else(|| addrs.first())
                    .copied()
                    .with_context(|| format!("No addresses found for domain: {}", domain))
            }
        }
    }

    /// Serialize as `ATYP | ADDR | PORT`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                bytes.push(SOCKS5_ADDR_TYPE_IPV4);
                bytes.extend_from_slice(&addr.ip().octets());
                bytes.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                bytes.push(SOCKS5_ADDR_TYPE_IPV6);
                bytes.extend_from_slice(&addr.ip().octets());
                bytes.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                bytes.push(SOCKS5_ADDR_TYPE_DOMAIN);
                bytes.push(domain.len() as u8);
                bytes.extend_from_slice(domain.as_bytes());
                bytes.extend_from_slice(&port.to_be_bytes());
            }
        }

        bytes
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks_command_bytes() {
        assert_eq!(SocksCommand::from_byte(1), Some(SocksCommand::Connect));
        assert_eq!(SocksCommand::from_byte(2), Some(SocksCommand::Bind));
        assert_eq!(SocksCommand::from_byte(3), Some(SocksCommand::UdpAssociate));
        assert_eq!(SocksCommand::from_byte(4), None);
        assert_eq!(SocksCommand::UdpAssociate.to_byte(), 3);
        assert_eq!(format!("{}", SocksCommand::UdpAssociate), "UDP ASSOCIATE");
    }

    #[test]
    fn test_target_addr_dial_string() {
        let addr = TargetAddr::ipv4(Ipv4Addr::new(10, 0, 0, 5), 443);
        assert_eq!(addr.to_string(), "10.0.0.5:443");

        let addr = TargetAddr::ipv6(Ipv6Addr::LOCALHOST, 80);
        assert_eq!(addr.to_string(), "[::1]:80");

        let addr = TargetAddr::domain("example.com".to_string(), 80);
        assert_eq!(addr.to_string(), "example.com:80");
        assert!(addr.is_domain());
    }

    #[test]
    fn test_target_addr_to_bytes() {
        let addr = TargetAddr::ipv4(Ipv4Addr::new(10, 0, 0, 1), 80);
        assert_eq!(addr.to_bytes(), vec![SOCKS5_ADDR_TYPE_IPV4, 10, 0, 0, 1, 0, 80]);

        let addr = TargetAddr::domain("a.io".to_string(), 53);
        assert_eq!(
            addr.to_bytes(),
            vec![SOCKS5_ADDR_TYPE_DOMAIN, 4, b'a', b'.', b'i', b'o', 0, 53]
        );

        let addr = TargetAddr::ipv6(Ipv6Addr::LOCALHOST, 1);
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), 1 + 16 + 2);
        assert_eq!(bytes[0], SOCKS5_ADDR_TYPE_IPV6);
    }

    #[tokio::test]
    async fn test_resolve_ip_is_identity() {
        let addr: SocketAddr = "10.0.0.5:443".parse().unwrap();
        assert_eq!(TargetAddr::Ip(addr).resolve().await.unwrap(), addr);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = TargetAddr::domain("localhost".to_string(), 8080);
        let resolved = addr.resolve().await.unwrap();
        assert!(resolved.ip().is_loopback());
        assert_eq!(resolved.port(), 8080);
    }
}
