//! Plugin API Server
//!
//! Serves the volume plugin protocol over HTTP until shut down.

use crate::bridge::lifecycle::VolumeBridge;
use crate::bridge::plugin_api::PluginRouter;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Configuration for the plugin API server
#[derive(Debug, Clone)]
pub struct PluginServerConfig {
    pub addr: SocketAddr,
}

impl Default for PluginServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8095)),
        }
    }
}

pub struct PluginServer {
    config: PluginServerConfig,
    bridge: Arc<VolumeBridge>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PluginServer {
    pub fn new(config: PluginServerConfig, bridge: Arc<VolumeBridge>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            bridge,
            shutdown_tx,
        }
    }

    /// Serve until [`PluginServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let app = PluginRouter::new(self.bridge.clone()).build();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind plugin API: {}", e)))?;
        info!("Plugin API listening on {}", self.config.addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Plugin API shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("Plugin API error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PluginServerConfig::default();
        assert_eq!(config.addr.port(), 8095);
        assert!(config.addr.ip().is_loopback());
    }
}
