//! SOCKS5 request parser

use crate::error::Socks5Error;
use crate::socks::consts::*;
use crate::socks::types::{SocksCommand, TargetAddr};
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Unrecognised parts of a request that still deserve a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRejection {
    /// CMD byte is not a known command
    Command(u8),
    /// ATYP byte is not a known address type
    AddressType(u8),
}

/// A request is either parsed or rejected with a SOCKS5 reply
pub type ParsedRequest = std::result::Result<(SocksCommand, TargetAddr), RequestRejection>;

/// Read one request from the client.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// I/O failures and a bad version are errors. An unknown command or
/// address type comes back as a [`RequestRejection`] so the caller can
/// answer before closing. Domain names are never resolved here.
pub async fn parse_command<S>(stream: &mut S) -> Result<ParsedRequest>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .with_context(|| "Failed to read command header")?;

    let version = header[0];
    let cmd_byte = header[1];
    let addr_type = header[3];

    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version).into());
    }

    let command = match SocksCommand::from_byte(cmd_byte) {
        Some(command) => command,
        None => return Ok(Err(RequestRejection::Command(cmd_byte))),
    };

    let target_addr = match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            TargetAddr::ipv4(Ipv4Addr::from(addr), stream.read_u16().await?)
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            let domain_len = stream.read_u8().await? as usize;
            if domain_len == 0 || domain_len > MAX_DOMAIN_LEN {
                return Err(Socks5Error::InvalidDomain(format!("length {}", domain_len)).into());
            }

            let mut domain_buf = vec![0u8; domain_len];
            stream.read_exact(&mut domain_buf).await?;
            let domain = String::from_utf8(domain_buf)
                .map_err(|e| Socks5Error::InvalidDomain(e.to_string()))?;

            TargetAddr::domain(domain, stream.read_u16().await?)
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            TargetAddr::ipv6(Ipv6Addr::from(addr), stream.read_u16().await?)
        }

        other => return Ok(Err(RequestRejection::AddressType(other))),
    };

    tracing::debug!("Parsed SOCKS5 command: {} to {}", command, target_addr);

    Ok(Ok((command, target_addr)))
}
