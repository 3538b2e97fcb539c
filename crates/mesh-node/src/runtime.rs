//! Node runtime: owns the server and its shutdown signal.

use anyhow::{Context, Result};
use mesh_server::{Server, ServerConfig, ServerHooks};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub struct NodeRuntime {
    server: Server,
    listener: Option<TcpListener>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeRuntime {
    /// Bind the listening socket and build the server.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let (server, listener) = Server::bind(config, ServerHooks::default())
            .await
            .context("Failed to start bus server")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            server,
            listener: Some(listener),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Serve in the background until [`NodeRuntime::shutdown`].
    pub fn start(&mut self) -> Result<tokio::task::JoinHandle<()>> {
        let listener = self
            .listener
            .take()
            .context("Node runtime already started")?;

        info!("===========================================");
        info!("  meshbus node v{}", mesh_server::VERSION);
        info!("===========================================");
        info!("Server id: {}", self.server.id());
        info!("Advertised address: {}", self.server.addr());
        info!("Configured peers: {}", self.server.config().peers.len());

        let server = self.server.clone();
        let mut shutdown = self.shutdown_rx.clone();
        Ok(tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.changed().await;
            };
            if let Err(e) = server.serve_with_shutdown(listener, signal).await {
                error!("Bus server failed: {}", e);
            }
        }))
    }

    /// Signal the server to stop accepting and drain.
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }
    }
}
