//! SOCKS5 listener

use super::handler::Session;
use crate::config::SocksConfig;
use crate::dialer::Dialer;
use crate::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// Pause after a failed accept, so descriptor exhaustion does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// SOCKS5 endpoint serving every client through one [`Dialer`]
#[derive(Debug)]
pub struct Socks5Server {
    config: Arc<SocksConfig>,
    dialer: Arc<dyn Dialer>,
    shutdown: CancellationToken,
}

impl Socks5Server {
    /// Create a server; nothing is bound until [`listen_and_serve`](Self::listen_and_serve)
    pub fn new(config: SocksConfig, dialer: Arc<dyn Dialer>) -> Self {
        Socks5Server {
            config: Arc::new(config),
            dialer,
            shutdown: CancellationToken::new(),
        }
    }

    /// Root token; cancelling it stops the accept loop and every session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting and cancel all sessions
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind `bind_addr` and serve until shutdown.
    ///
    /// A bind failure is returned as [`Error::Listen`].
    pub async fn listen_and_serve(&self, bind_addr: &str) -> Result<(), Error> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| Error::Listen {
                addr: bind_addr.to_string(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve clients from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        info!("SOCKS5 endpoint listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("SOCKS5 endpoint shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.spawn_session(stream, peer_addr),
                Err(e) => {
                    error!("Failed to accept SOCKS5 connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!("Dropping client {}: {}", peer_addr, e);
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let ctx = self.shutdown.child_token();
        let session = Session::new(
            self.config.clone(),
            self.dialer.clone(),
            ctx.clone(),
            peer_addr,
            local_addr,
        );

        let span = info_span!("socks5", peer = %peer_addr);
        tokio::spawn(
            async move {
                let _guard = ctx.drop_guard();
                debug!("Accepted client");
                match session.run(stream).await {
                    Ok(()) => debug!("Session finished"),
                    Err(e) => debug!("Session ended with error: {:#}", e),
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server() -> Socks5Server {
        Socks5Server::new(SocksConfig::default(), Arc::new(DirectDialer::default()))
    }

    #[tokio::test]
    async fn test_listen_failure_is_listen_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let err = server().listen_and_serve(&addr).await.unwrap_err();
        match err {
            Error::Listen { addr: failed, .. } => assert_eq!(failed, addr),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listen_bad_address() {
        let err = server().listen_and_serve("not an address").await.unwrap_err();
        assert!(matches!(err, Error::Listen { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let server = Arc::new(server());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        server.shutdown();
        serving.await.unwrap().unwrap();
        assert!(server.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_bind_is_refused() {
        let server = Arc::new(server());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await });
        }

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        client
            .write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);

        server.shutdown();
    }
}
