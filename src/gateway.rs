//! Gateway assembly
//!
//! Builds every long-lived component from a [`GatewayConfig`] and owns the
//! background tasks that keep them tidy: the transfer sweeper, registry
//! liveness and token purging.

use crate::api::{ApiServerConfig, AppState};
use crate::auth::{TokenAuthority, UserStore};
use crate::chunk::ChunkAssembler;
use crate::config::GatewayConfig;
use crate::domain::ports::{RegistryDriverRef, RegistryNode};
use crate::error::Result;
use crate::metrics::GatewayMetrics;
use crate::registry::NodeRegistry;
use crate::storage::StorageFacade;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How often expired sessions are dropped
const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// The wired-up gateway core
pub struct Gateway {
    config: GatewayConfig,
    pub facade: Arc<StorageFacade>,
    pub assembler: Arc<ChunkAssembler>,
    pub tokens: Arc<TokenAuthority>,
    pub registry: Arc<NodeRegistry>,
}

impl Gateway {
    /// Create backends, staging and the identity store
    pub async fn build(config: GatewayConfig) -> Result<Self> {
        let metrics = GatewayMetrics::new()?;

        let mut facade = StorageFacade::new(metrics);
        for backend in &config.backends {
            let route = backend.build_route().await?;
            info!(backend = %route.name, kind = ?backend.kind, "Storage backend ready");
            facade = facade.with_route(route);
        }
        let facade = Arc::new(facade);

        let assembler = Arc::new(ChunkAssembler::new(config.chunks.to_chunk_config(), facade.clone()).await?);

        let users = Arc::new(UserStore::from_records(&config.auth.users));
        info!(users = users.len(), "User store loaded");
        let tokens = Arc::new(TokenAuthority::new(
            users,
            Duration::from_secs(config.auth.token_ttl_secs),
        ));

        Ok(Self {
            config,
            facade,
            assembler,
            tokens,
            registry: NodeRegistry::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Handler state for the REST router
    pub fn app_state(&self) -> AppState {
        let registry: RegistryDriverRef = self.registry.clone();
        AppState::new(
            self.facade.clone(),
            self.assembler.clone(),
            self.tokens.clone(),
            registry,
        )
    }

    pub fn server_config(&self) -> Result<ApiServerConfig> {
        ApiServerConfig::from_settings(&self.config.server)
    }

    /// Announce this process in the registry
    pub fn register_self(&self) -> Result<RegistryNode> {
        let settings = &self.config.registry;
        let node = RegistryNode {
            id: settings.node_id.clone(),
            role: settings.role.clone(),
            system_version: crate::VERSION.to_string(),
            host: settings
                .advertise_host
                .clone()
                .unwrap_or_else(|| self.config.server.addr.clone()),
        };
        self.registry.register(node.clone())?;
        info!(node_id = %node.id, role = %node.role, host = %node.host, "Registered in node registry");
        Ok(node)
    }

    /// Start the sweeper, registry liveness and token purge loops
    pub fn spawn_background(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let settings = &self.config.registry;
        let max_age = chrono::Duration::seconds(settings.max_heartbeat_age_secs as i64);

        vec![
            self.assembler.clone().spawn_sweeper(shutdown.subscribe()),
            self.registry.clone().spawn_liveness(
                settings.node_id.clone(),
                Duration::from_secs(settings.heartbeat_interval_secs),
                max_age,
                shutdown.subscribe(),
            ),
            spawn_token_purge(self.tokens.clone(), shutdown.subscribe()),
        ]
    }
}

fn spawn_token_purge(tokens: Arc<TokenAuthority>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TOKEN_PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = tokens.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Expired sessions dropped");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRecord;
    use crate::config::{BackendConfig, BackendKind};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.backends.push(BackendConfig {
            name: "mem".to_string(),
            kind: BackendKind::Memory,
            ..BackendConfig::default()
        });
        config.chunks.staging_dir = dir.path().join("staging");
        config.auth.users.push(UserRecord {
            username: "alice".to_string(),
            password: "secret".to_string(),
            email: String::new(),
            display_name: String::new(),
        });
        config
    }

    #[tokio::test]
    async fn test_build_and_register() {
        let dir = TempDir::new().unwrap();
        let gateway = Gateway::build(config(&dir)).await.unwrap();

        assert_eq!(gateway.facade.routes().len(), 1);
        assert_eq!(gateway.tokens.users().len(), 1);

        let node = gateway.register_self().unwrap();
        assert_eq!(node.host, "0.0.0.0:9000");
        assert_eq!(gateway.registry.nodes_for_role("gateway"), vec![node]);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let gateway = Gateway::build(config(&dir)).await.unwrap();
        gateway.register_self().unwrap();

        let (shutdown, _) = broadcast::channel(1);
        let handles = gateway.spawn_background(&shutdown);
        shutdown.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
