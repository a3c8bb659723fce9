//! Per-client SOCKS5 session
//!
//! A [`Session`] owns everything one client connection needs: the
//! endpoint configuration, the shared dialer, the session's cancellation
//! token and both ends of the control connection's address pair.

use super::auth::authenticate;
use super::command::{
    build_reply, parse_command, send_address_type_not_supported, send_command_not_supported,
    send_dial_error, send_success, RequestRejection,
};
use super::relay::relay_tcp;
use super::types::{SocksCommand, TargetAddr};
use super::udp::handle_udp_associate;
use crate::config::SocksConfig;
use crate::dialer::{Dialer, Network};
use crate::error::{DialError, Socks5Error, Socks5ReplyCode};
use crate::transport::Connection;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by one client's request handling
#[derive(Debug, Clone)]
pub struct Session {
    config: Arc<SocksConfig>,
    dialer: Arc<dyn Dialer>,
    ctx: CancellationToken,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl Session {
    /// Create a session for a client connected from `peer_addr` to the
    /// endpoint's `local_addr`
    pub fn new(
        config: Arc<SocksConfig>,
        dialer: Arc<dyn Dialer>,
        ctx: CancellationToken,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Session {
            config,
            dialer,
            ctx,
            peer_addr,
            local_addr,
        }
    }

    /// Endpoint configuration
    pub fn config(&self) -> &SocksConfig {
        &self.config
    }

    /// Session cancellation token
    pub fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    /// Client address of the control connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Endpoint address of the control connection
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle one client from greeting to teardown.
    ///
    /// 1. Method negotiation, then username/password if selected
    /// 2. Request parsing
    /// 3. CONNECT, UDP ASSOCIATE, or a BIND refusal
    pub async fn run<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let auth_method = authenticate(&mut stream, &self.config)
            .await
            .with_context(|| "Authentication negotiation failed")?;

        debug!("Authentication completed with method: {:?}", auth_method);

        let (command, target) = match parse_command(&mut stream)
            .await
            .with_context(|| "Failed to parse SOCKS5 command")?
        {
            Ok(request) => request,
            Err(RequestRejection::Command(byte)) => {
                warn!("Unknown SOCKS5 command: {}", byte);
                send_command_not_supported(&mut stream).await?;
                return Err(Socks5Error::CommandNotSupported(byte).into());
            }
            Err(RequestRejection::AddressType(byte)) => {
                warn!("Unknown SOCKS5 address type: {}", byte);
                send_address_type_not_supported(&mut stream).await?;
                return Err(Socks5Error::AddressTypeNotSupported(byte).into());
            }
        };

        info!("SOCKS5 {} request to {}", command, target);

        match command {
            SocksCommand::Connect => self.handle_connect(stream, target).await,
            SocksCommand::UdpAssociate => {
                if self.config.allow_udp {
                    handle_udp_associate(self, stream, target).await
                } else {
                    warn!("UDP ASSOCIATE not allowed by configuration");
                    send_command_not_supported(&mut stream).await
                }
            }
            SocksCommand::Bind => {
                warn!("BIND command not supported");
                send_command_not_supported(&mut stream).await
            }
        }
    }

    async fn handle_connect<S>(&self, mut stream: S, target: TargetAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let target = match self.prepare_target(&target).await {
            Ok(target) => target,
            Err(e) => {
                build_reply(&mut stream, Socks5ReplyCode::HostUnreachable, None).await?;
                return Err(e);
            }
        };

        let conn = match self.dial(&Network::Tcp, &target).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to connect to {}: {}", target, e);
                send_dial_error(&mut stream, &e).await?;
                return Err(e.into());
            }
        };

        let (remote, local_addr) = match conn {
            Connection::Stream { stream, local_addr } => (stream, local_addr),
            Connection::Datagram(_) => {
                build_reply(&mut stream, Socks5ReplyCode::GeneralFailure, None).await?;
                bail!("Dialer returned a datagram socket for {}", target);
            }
        };

        send_success(&mut stream, local_addr).await?;
        info!("SOCKS5 tunnel established to {}", target);

        relay_tcp(&self.ctx, stream, remote).await?;
        Ok(())
    }

    /// Resolve domain targets when `dns_resolve` is on; otherwise the
    /// target passes through untouched.
    pub async fn prepare_target(&self, target: &TargetAddr) -> Result<TargetAddr> {
        if self.config.dns_resolve && target.is_domain() {
            let resolved = target.resolve().await?;
            debug!("Resolved {} to {}", target, resolved);
            Ok(TargetAddr::Ip(resolved))
        } else {
            Ok(target.clone())
        }
    }

    /// Dial `target` through the session's dialer.
    ///
    /// Each dial gets a child of the session token, cancelled when the dial
    /// exceeds `request_timeout`.
    pub async fn dial(&self, network: &Network, target: &TargetAddr) -> Result<Connection, DialError> {
        let addr = target.to_string();
        let dial_ctx = self.ctx.child_token();
        let timeout = Duration::from_secs(self.config.request_timeout);

        match tokio::time::timeout(timeout, self.dialer.dial(&dial_ctx, network, &addr)).await {
            Ok(result) => result,
            Err(_) => {
                dial_ctx.cancel();
                debug!("Dial to {} over {} timed out after {:?}", addr, network, timeout);
                Err(DialError::TimedOut)
            }
        }
    }
}
