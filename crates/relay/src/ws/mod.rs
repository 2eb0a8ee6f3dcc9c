//! Async WebSocket server using tokio-tungstenite
//!
//! Accepts member connections, one task per connection, until shutdown.
//!
//! ## Module Structure
//! - `protocol`: room path parsing, origin validation
//! - `connection`: handshake, sync exchange, frame relaying
//! - `rate_limit`: per-connection token bucket

mod connection;
mod protocol;
mod rate_limit;

pub use connection::{handle_connection, ConnectionInfo};
pub use protocol::{parse_room_from_uri, validate_origin};
pub use rate_limit::RateLimiter;

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::room::SharedRoomRegistry;

/// Serve relay connections on `listener` until `shutdown` is cancelled
///
/// Cancelling also closes every open connection.
pub async fn serve(
    listener: TcpListener,
    registry: SharedRoomRegistry,
    config: Arc<RelayConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Relay listening");

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let registry = registry.clone();
                let config = Arc::clone(&config);
                let shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, registry, config, shutdown).await {
                        tracing::warn!(peer = %peer, error = %e, "Connection error");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept failed");
            }
        }
    }

    tracing::info!(addr = %addr, "Relay stopped");
    Ok(())
}
