//! Bidirectional stream relay for CONNECT sessions

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Copy bytes both ways until both directions reach EOF, either side
/// fails, or `ctx` is cancelled.
///
/// EOF on one side is forwarded as a write shutdown to the other.
/// Returns the bytes copied as `(client_to_remote, remote_to_client)`.
pub async fn relay_tcp<A, B>(
    ctx: &CancellationToken,
    mut client: A,
    mut remote: B,
) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        _ = ctx.cancelled() => {
            debug!("Relay cancelled");
            Ok((0, 0))
        }
        result = tokio::io::copy_bidirectional(&mut client, &mut remote) => {
            match result {
                Ok((up, down)) => {
                    debug!("Relay finished: {} bytes up, {} bytes down", up, down);
                    Ok((up, down))
                }
                Err(e) => {
                    debug!("Relay error: {}", e);
                    Err(e.into())
                }
            }
        }
    }
}
