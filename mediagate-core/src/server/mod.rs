//! TCP listeners for the RTMP and RTSP media ports. Each accepted
//! connection runs in its own task and talks to the
//! [`SessionManager`](crate::session::SessionManager).

pub mod rtmp;
pub mod rtsp;

use std::{future::Future, net::SocketAddr};

use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::{
    error::{GatewayError, Result},
    frame::StreamKey,
};

pub use rtmp::RtmpServer;
pub use rtsp::RtspServer;

pub async fn bind(address: &str) -> Result<TcpListener> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| GatewayError::Config(format!("invalid listen address {address}: {e}")))?;
    TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::transport(format!("bind {addr}: {e}")))
}

/// Accepts until `cancel` fires, spawning `handle` per connection.
pub(crate) fn spawn_accept_loop<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    cancel: CancellationToken,
    handle: F,
) -> JoinHandle<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "{name} listener started");
    }
    tokio::spawn(async move {
        loop {
            let (socket, peer) = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "{name} accept failed");
                        continue;
                    }
                },
            };
            let _ = socket.set_nodelay(true);
            debug!(%peer, "{name} connection accepted");
            let connection = handle(socket, peer);
            tokio::spawn(
                async move {
                    match connection.await {
                        Ok(()) => debug!("Connection closed"),
                        Err(e @ (GatewayError::NotFound(_) | GatewayError::Busy(_) | GatewayError::Unsupported(_))) => {
                            info!(error = %e, "Connection refused");
                        }
                        Err(e) => warn!(error = %e, "Connection ended with error"),
                    }
                }
                .instrument(tracing::info_span!("conn", protocol = name, %peer)),
            );
        }
        info!("{name} listener stopped");
    })
}

/// `app/stream` from a request path such as `/live/cam1/track0?token=x`.
pub(crate) fn stream_key_from_path(path: &str) -> Result<StreamKey> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    match (segments.next(), segments.next()) {
        (Some(app), Some(stream)) => StreamKey::new(app, stream),
        _ => Err(GatewayError::InvalidInput(format!("no app/stream in {path}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_from_path() {
        let key = stream_key_from_path("/live/cam1/track0?token=abc").unwrap();
        assert_eq!(key.to_string(), "live/cam1");
        assert!(stream_key_from_path("/live").is_err());
        assert!(stream_key_from_path("").is_err());
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        assert!(matches!(bind("not an address").await, Err(GatewayError::Config(_))));
        let listener = bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
