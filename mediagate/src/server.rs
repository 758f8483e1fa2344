//! Server lifecycle management
//!
//! Starts the session manager, the RTMP and RTSP listeners and the HTTP
//! server, then waits for a signal and shuts everything down in order:
//! stop accepting, drain streams and recordings, stop background tasks.

use std::{sync::Arc, time::Duration};

use mediagate_core::{
    config::Config,
    server::{self as listeners, RtmpServer, RtspServer},
    session::SessionManager,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::http;

pub struct GatewayServer {
    config: Arc<Config>,
    session: Arc<SessionManager>,
    cancel: CancellationToken,
}

impl GatewayServer {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let session = SessionManager::from_config(&config).await?;
        Ok(Self {
            config: Arc::new(config),
            session,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all servers and wait for shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting mediagate...");
        self.session.start().await?;

        let rtmp_listener = listeners::bind(&self.config.rtmp_address()).await?;
        let rtsp_listener = listeners::bind(&self.config.rtsp_address()).await?;
        let http_listener = listeners::bind(&self.config.http_address()).await?;

        let rtmp = RtmpServer::new(Arc::clone(&self.session)).spawn(rtmp_listener, self.cancel.child_token());
        let rtsp = RtspServer::new(Arc::clone(&self.session)).spawn(rtsp_listener, self.cancel.child_token());
        let http = self.start_http_server(http_listener);

        info!(
            http = %self.config.http_address(),
            rtmp = %self.config.rtmp_address(),
            rtsp = %self.config.rtsp_address(),
            "All servers started"
        );

        tokio::select! {
            _ = http => error!("HTTP server stopped unexpectedly"),
            _ = rtmp => error!("RTMP listener stopped unexpectedly"),
            _ = rtsp => error!("RTSP listener stopped unexpectedly"),
            () = shutdown_signal() => info!("Shutdown signal received, starting graceful shutdown..."),
        }

        self.shutdown().await;
        Ok(())
    }

    fn start_http_server(&self, listener: tokio::net::TcpListener) -> JoinHandle<()> {
        let router = http::create_router(Arc::clone(&self.session), Arc::clone(&self.config));
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        })
    }

    async fn shutdown(&self) {
        let timeout = Duration::from_secs(self.config.server.shutdown_timeout_seconds);
        info!(
            timeout = %humantime::format_duration(timeout),
            streams = self.session.registry().len(),
            "Shutting down mediagate..."
        );

        // listeners first, so nothing new arrives while streams drain
        self.cancel.cancel();
        if self.session.shutdown(timeout).await {
            info!("mediagate shut down complete");
        } else {
            warn!("Shutdown timed out with recordings still open");
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
