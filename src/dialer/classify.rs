//! Target address classification.
//!
//! A target is the raw `host:port` string the SOCKS5 layer hands to the
//! dialer. More than one `:` means IPv6 and nothing else is inspected;
//! bracketed literals such as `[::1]:80` fall in the same bucket. Any
//! other target must carry a decimal port after its first `:`.

use crate::error::DialError;
use std::net::IpAddr;

/// Address family of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4, or a host that is not an IPv6 literal
    V4,
    /// IPv6
    V6,
}

/// Shape of the host part of a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostForm {
    /// Parses as an IP address, no resolution needed
    Literal(IpAddr),
    /// Domain name, empty host or garbage
    Opaque(String),
}

/// Result of classifying a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Multi-colon target; host and port are not parsed
    Ipv6,
    /// Single-colon target with a valid port
    Ipv4 {
        /// Host part
        host: HostForm,
        /// Port part
        port: u16,
    },
}

impl Classification {
    /// Address family of the target
    pub fn family(&self) -> AddressFamily {
        match self {
            Classification::Ipv6 => AddressFamily::V6,
            Classification::Ipv4 { .. } => AddressFamily::V4,
        }
    }

    /// Host form, when the host was parsed at all
    pub fn form(&self) -> Option<&HostForm> {
        match self {
            Classification::Ipv6 => None,
            Classification::Ipv4 { host, .. } => Some(host),
        }
    }
}

/// Classify a `host:port` target.
///
/// Fails with [`DialError::MalformedTarget`] only when a non-IPv6 target
/// has no port, or a port that is not a decimal number in `0..=65535`.
pub fn classify(target: &str) -> Result<Classification, DialError> {
    if target.matches(':').count() > 1 {
        return Ok(Classification::Ipv6);
    }

    let (host, port) = target
        .split_once(':')
        .ok_or_else(|| DialError::MalformedTarget(target.to_string()))?;

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DialError::MalformedTarget(target.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| DialError::MalformedTarget(target.to_string()))?;

    let host = match host.parse::<IpAddr>() {
        Ok(ip) => HostForm::Literal(ip),
        Err(_) => HostForm::Opaque(host.to_string()),
    };

    Ok(Classification::Ipv4 { host, port })
}
