//! Username/password authentication (RFC 1929)

use crate::config::SocksConfig;
use crate::error::Socks5Error;
use crate::socks::consts::SOCKS5_AUTH_VERSION;
use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

/// Username/password authentication handler
pub struct PasswordAuth;

impl PasswordAuth {
    /// Run the sub-negotiation against the expected credentials.
    ///
    /// ```text
    /// +----+------+----------+------+----------+
    /// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    /// +----+------+----------+------+----------+
    /// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    /// +----+------+----------+------+----------+
    /// ```
    ///
    /// The server answers `VER | STATUS`; any status but zero closes the
    /// session.
    pub async fn authenticate<S>(
        stream: &mut S,
        expected_username: &str,
        expected_password: &str,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;

        let version = buf[0];
        let username_len = buf[1] as usize;

        if version != SOCKS5_AUTH_VERSION {
            send_auth_result(stream, AUTH_FAILURE).await?;
            bail!("Invalid auth version: {}", version);
        }

        if username_len == 0 {
            send_auth_result(stream, AUTH_FAILURE).await?;
            bail!("Invalid username length: {}", username_len);
        }

        let mut username = vec![0u8; username_len];
        stream.read_exact(&mut username).await?;

        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await?;
        let password_len = buf[0] as usize;

        if password_len == 0 {
            send_auth_result(stream, AUTH_FAILURE).await?;
            bail!("Invalid password length: {}", password_len);
        }

        let mut password = vec![0u8; password_len];
        stream.read_exact(&mut password).await?;

        if username == expected_username.as_bytes() && password == expected_password.as_bytes() {
            send_auth_result(stream, AUTH_SUCCESS).await?;
            debug!(
                "Authentication successful for user: {}",
                String::from_utf8_lossy(&username)
            );
            Ok(())
        } else {
            send_auth_result(stream, AUTH_FAILURE).await?;
            debug!(
                "Authentication failed for user: {}",
                String::from_utf8_lossy(&username)
            );
            Err(Socks5Error::AuthFailed.into())
        }
    }
}

async fn send_auth_result<S: AsyncWrite + Unpin>(stream: &mut S, status: u8) -> Result<()> {
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    Ok(())
}

/// Authenticate against the credentials in `config`
pub async fn authenticate_password<S>(stream: &mut S, config: &SocksConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let username = config
        .username
        .as_ref()
        .ok_or_else(|| anyhow!("Username not configured"))?;
    let password = config
        .password
        .as_ref()
        .ok_or_else(|| anyhow!("Password not configured"))?;

    PasswordAuth::authenticate(stream, username, password).await
}
