//! HTTP host for context-aware routers.
//!
//! Binds a listener, serves an axum [`Router`] with graceful shutdown, and
//! reports the port it actually bound (port 0 picks a free one).

use std::net::SocketAddr;

use axum::Router;
use tokio::sync::mpsc;
use tracing::info;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            hostname: "127.0.0.1".into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// A running server.
pub struct ContextServer {
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl ContextServer {
    /// Bind and start serving `app` in a background task.
    pub async fn start(config: ServerConfig, app: Router) -> Result<Self, ServerError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("Context server listening on http://{}:{}", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Context server stopped");
    }
}
