//! SOCKS5 reply builder

use crate::error::{DialError, Socks5ReplyCode};
use crate::socks::consts::*;
use anyhow::Result;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Encode a reply.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// A missing bind address is sent as `0.0.0.0:0`.
pub fn encode_reply(code: Socks5ReplyCode, bind_addr: Option<SocketAddr>) -> Vec<u8> {
    let bind_addr = bind_addr.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    let mut reply = vec![SOCKS5_VERSION, u8::from(code), SOCKS5_RESERVED];
    match bind_addr {
        SocketAddr::V4(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    reply
}

/// Send a reply and flush
pub async fn build_reply<S>(
    stream: &mut S,
    code: Socks5ReplyCode,
    bind_addr: Option<SocketAddr>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(code, bind_addr)).await?;
    stream.flush().await?;
    Ok(())
}

/// Send a success reply
pub async fn send_success<S>(stream: &mut S, bind_addr: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    build_reply(stream, Socks5ReplyCode::Succeeded, bind_addr).await
}

/// Send the failure reply matching a dial error
pub async fn send_dial_error<S>(stream: &mut S, error: &DialError) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    build_reply(stream, Socks5ReplyCode::from(error), None).await
}

/// Send "command not supported"
pub async fn send_command_not_supported<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    build_reply(stream, Socks5ReplyCode::CommandNotSupported, None).await
}

/// Send "address type not supported"
pub async fn send_address_type_not_supported<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    build_reply(stream, Socks5ReplyCode::AddressTypeNotSupported, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_encode_reply_default_bind() {
        assert_eq!(
            encode_reply(Socks5ReplyCode::Succeeded, None),
            vec![5, 0, 0, SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_encode_reply_ipv4_bind() {
        let addr: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        assert_eq!(
            encode_reply(Socks5ReplyCode::Succeeded, Some(addr)),
            vec![5, 0, 0, SOCKS5_ADDR_TYPE_IPV4, 127, 0, 0, 1, 0x04, 0x38]
        );
    }

    #[test]
    fn test_encode_reply_ipv6_bind() {
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        let reply = encode_reply(Socks5ReplyCode::GeneralFailure, Some(addr));
        assert_eq!(reply.len(), 4 + 16 + 2);
        assert_eq!(reply[1], 0x01);
        assert_eq!(reply[3], SOCKS5_ADDR_TYPE_IPV6);
    }

    #[tokio::test]
    async fn test_send_dial_error_codes() {
        let mut out = Vec::new();
        let err = DialError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        send_dial_error(&mut out, &err).await.unwrap();
        assert_eq!(out[1], 0x05);

        let mut out = Vec::new();
        let err = DialError::MalformedTarget("10.0.0.5:abc".to_string());
        send_dial_error(&mut out, &err).await.unwrap();
        assert_eq!(out[1], 0x01);

        let mut out = Vec::new();
        send_command_not_supported(&mut out).await.unwrap();
        assert_eq!(out[1], 0x07);

        let mut out = Vec::new();
        send_address_type_not_supported(&mut out).await.unwrap();
        assert_eq!(out[1], 0x08);
    }
}
