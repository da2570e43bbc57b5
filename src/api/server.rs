//! API Server
//!
//! Binds the REST router and serves it until a shutdown signal arrives.
//! In-flight requests get `shutdown_timeout` to finish; connections still
//! open after that are dropped.

use crate::config::{CorsConfig, ServerConfig, ServicesConfig};
use crate::error::{Error, Result};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::rest::{AppState, RestRouter};

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub addr: SocketAddr,
    /// Drain limit for in-flight requests after shutdown is signalled
    pub shutdown_timeout: Duration,
    pub services: ServicesConfig,
    pub cors: CorsConfig,
}

impl ApiServerConfig {
    pub fn from_settings(settings: &ServerConfig) -> Result<Self> {
        Ok(Self {
            addr: settings.socket_addr()?,
            shutdown_timeout: settings.shutdown_timeout(),
            services: settings.services.clone(),
            cors: settings.cors.clone(),
        })
    }
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            shutdown_timeout: Duration::from_secs(30),
            services: ServicesConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// HTTP server for the gateway API
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            state,
            shutdown_tx,
        }
    }

    /// Sender that stops the server when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let app = RestRouter::new(self.state.clone(), self.config.cors.clone())
            .with_services(self.config.services.clone())
            .build();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut deadline_rx = self.shutdown_tx.subscribe();
        let grace = self.config.shutdown_timeout;

        info!(
            "REST API listening on {}",
            listener.local_addr().map_err(Error::Io)?
        );

        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .into_future();
        let deadline = async move {
            let _ = deadline_rx.recv().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = server => {
                result.map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;
            }
            _ = deadline => {
                warn!(
                    timeout_secs = grace.as_secs_f64(),
                    "Shutdown timeout elapsed, abandoning open connections"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, BackendKind, GatewayConfig};
    use crate::gateway::Gateway;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.addr.port(), 9000);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(config.cors.enabled);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = ServerConfig {
            addr: "127.0.0.1:9100".to_string(),
            shutdown_timeout_secs: 7,
            ..ServerConfig::default()
        };
        let config = ApiServerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.addr.port(), 9100);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(7));

        let bad = ServerConfig {
            addr: "not an address".to_string(),
            ..ServerConfig::default()
        };
        assert!(ApiServerConfig::from_settings(&bad).is_err());
    }

    #[tokio::test]
    async fn test_stalled_request_does_not_block_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = GatewayConfig::default();
        config.backends = vec![BackendConfig {
            kind: BackendKind::Memory,
            ..BackendConfig::default()
        }];
        config.chunks.staging_dir = dir.path().join("staging");
        let gateway = Gateway::build(config).await.unwrap();

        let server = Arc::new(ApiServer::new(
            ApiServerConfig {
                shutdown_timeout: Duration::from_millis(200),
                ..ApiServerConfig::default()
            },
            gateway.app_state(),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        // Announce a body that never fully arrives
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(
                b"POST /api/v1/auth/token HTTP/1.1\r\nhost: localhost\r\n\
                  content-type: application/json\r\ncontent-length: 1000\r\n\r\n{\"user",
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("server outlived its shutdown timeout")
            .unwrap();
        assert!(result.is_ok());
        drop(client);
    }
}
