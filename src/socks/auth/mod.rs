//! SOCKS5 method negotiation
//!
//! Handles the greeting and, when credentials are configured, RFC 1929
//! username/password authentication.

mod password;

pub use password::PasswordAuth;

use super::consts::*;
use crate::config::SocksConfig;
use crate::error::Socks5Error;
use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Authentication method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required
    None,
    /// Username/password authentication
    Password,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::None => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Password => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }

    /// Parse from SOCKS5 method byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_AUTH_METHOD_NONE => Some(AuthMethod::None),
            SOCKS5_AUTH_METHOD_PASSWORD => Some(AuthMethod::Password),
            _ => None,
        }
    }
}

/// Negotiate a method with the client and authenticate if required.
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
pub async fn authenticate<S>(stream: &mut S, config: &SocksConfig) -> Result<AuthMethod>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let num_methods = buf[1];

    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version).into());
    }

    if num_methods == 0 {
        bail!("No authentication methods provided");
    }

    let mut methods = vec![0u8; num_methods as usize];
    stream.read_exact(&mut methods).await?;

    let selected_method = select_auth_method(&methods, config);

    stream
        .write_all(&[
            SOCKS5_VERSION,
            selected_method
                .map(|m| m.to_byte())
                .unwrap_or(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE),
        ])
        .await?;
    stream.flush().await?;

    let method = match selected_method {
        Some(m) => m,
        None => return Err(Socks5Error::NoAcceptableMethod.into()),
    };

    if method == AuthMethod::Password {
        password::authenticate_password(stream, config).await?;
    }

    Ok(method)
}

/// Pick a method from the client's offer.
///
/// With `auth_required` only password is acceptable. Otherwise no-auth is
/// preferred, and password is offered when credentials exist.
fn select_auth_method(methods: &[u8], config: &SocksConfig) -> Option<AuthMethod> {
    if config.auth_required {
        if methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD) {
            return Some(AuthMethod::Password);
        }
    } else {
        if methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
            return Some(AuthMethod::None);
        }
        if config.has_credentials() && methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD) {
            return Some(AuthMethod::Password);
        }
    }
    None
}
