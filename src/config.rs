//! Gateway Configuration
//!
//! Loaded from a YAML file; every section has defaults so the gateway runs
//! with no file at all (one local backend under `./data`).
//!
//! ```yaml
//! server:
//!   addr: 0.0.0.0:9000
//!   shutdown_timeout_secs: 30
//!   services: { auth: true, data: true, meta: true, registry: true }
//! backends:
//!   - name: archive
//!     kind: memory
//!     path_prefix: /archive
//!   - name: home
//!     kind: local
//!     root_path: /var/lib/sync-gateway
//!     verify_mode: required
//! auth:
//!   users:
//!     - username: alice
//!       password: sha256:2bb80d...
//! ```

use crate::auth::UserRecord;
use crate::checksum::ChecksumAlgorithm;
use crate::chunk::ChunkConfig;
use crate::domain::path::NamespacePath;
use crate::domain::ports::{Capabilities, StorageDriverRef, VerifyMode};
use crate::error::{Error, Result};
use crate::storage::{
    BackendRoute, LocalDriver, LocalDriverConfig, MemoryDriver, MemoryDriverConfig, RouteMatcher,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// =============================================================================
// Root
// =============================================================================

/// Complete process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub backends: Vec<BackendConfig>,
    pub chunks: ChunkSettings,
    pub auth: AuthConfig,
    pub registry: RegistrySettings,
}

impl GatewayConfig {
    /// Read and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&raw)?;
        info!(path = %path.display(), backends = config.backends.len(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: GatewayConfig = serde_yaml::from_str(raw)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill in the default backend when none is configured
    pub fn apply_defaults(&mut self) {
        if self.backends.is_empty() {
            self.backends.push(BackendConfig::default());
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;
        if self.backends.is_empty() {
            return Err(Error::Configuration("at least one backend is required".into()));
        }
        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate backend name: {}",
                    backend.name
                )));
            }
            backend.matcher()?;
        }
        if self.chunks.sweep_interval_secs == 0 {
            return Err(Error::Configuration("chunks.sweep_interval_secs must be > 0".into()));
        }
        if self.registry.node_id.is_empty() || self.registry.role.is_empty() {
            return Err(Error::Configuration("registry.node_id and registry.role are required".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Server
// =============================================================================

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub addr: String,
    /// Grace period for in-flight requests once shutdown starts
    pub shutdown_timeout_secs: u64,
    pub services: ServicesConfig,
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:9000".to_string(),
            shutdown_timeout_secs: 30,
            services: ServicesConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid server address {}: {}", self.addr, e)))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Route groups mounted under `/api/v1`; `/health` and `/metrics` are always on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// `/auth/token`
    pub auth: bool,
    /// `/data/*` and `/transfers/*`
    pub data: bool,
    /// `/meta/*`
    pub meta: bool,
    /// `/registry/*`
    pub registry: bool,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            auth: true,
            data: true,
            meta: true,
            registry: true,
        }
    }
}

/// Cross-origin settings; `*` allows any
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "PUT", "POST", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: vec!["*".to_string()],
        }
    }
}

// =============================================================================
// Backends
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Filesystem tree with sidecar metadata
    Local,
    /// In-memory row table
    Memory,
}

/// One storage backend and the requests it serves
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    /// Root directory for `local` backends
    pub root_path: PathBuf,
    /// Temporary upload directory for `local` backends
    pub temporary_path: Option<PathBuf>,
    pub sync_writes: bool,
    /// Serve only this path prefix
    pub path_prefix: Option<String>,
    /// Serve only these users
    pub users: Vec<String>,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub verify_mode: VerifyMode,
    pub create_home_dir: bool,
    /// Largest accepted file, 0 for unlimited
    pub max_file_size: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            kind: BackendKind::Local,
            root_path: PathBuf::from("./data/local"),
            temporary_path: None,
            sync_writes: false,
            path_prefix: None,
            users: Vec::new(),
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            verify_mode: VerifyMode::IfPresent,
            create_home_dir: true,
            max_file_size: 0,
        }
    }
}

impl BackendConfig {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            create_home_dir: self.create_home_dir,
            verify_mode: self.verify_mode,
            checksum_algorithm: self.checksum_algorithm,
            max_file_size: self.max_file_size,
        }
    }

    /// Routing rule for this backend; prefix and user filters cannot be combined
    pub fn matcher(&self) -> Result<RouteMatcher> {
        match (&self.path_prefix, self.users.is_empty()) {
            (Some(_), false) => Err(Error::Configuration(format!(
                "backend {}: path_prefix and users are mutually exclusive",
                self.name
            ))),
            (Some(prefix), true) => {
                let prefix = NamespacePath::parse(prefix).map_err(|e| {
                    Error::Configuration(format!("backend {}: {}", self.name, e))
                })?;
                Ok(RouteMatcher::PathPrefix(prefix))
            }
            (None, false) => Ok(RouteMatcher::Users(self.users.clone())),
            (None, true) => Ok(RouteMatcher::Any),
        }
    }

    /// Instantiate the driver and its route
    pub async fn build_route(&self) -> Result<BackendRoute> {
        let driver: StorageDriverRef = match self.kind {
            BackendKind::Local => Arc::new(
                LocalDriver::with_config(LocalDriverConfig {
                    name: self.name.clone(),
                    root_path: self.root_path.clone(),
                    temporary_path: self.temporary_path.clone(),
                    sync_writes: self.sync_writes,
                    capabilities: self.capabilities(),
                })
                .await?,
            ),
            BackendKind::Memory => Arc::new(MemoryDriver::with_config(MemoryDriverConfig {
                name: self.name.clone(),
                capabilities: self.capabilities(),
            })),
        };
        Ok(BackendRoute::new(self.matcher()?, driver))
    }
}

// =============================================================================
// Chunked Transfers
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    pub staging_dir: PathBuf,
    pub inactivity_window_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_chunk_size: u64,
    pub max_chunks: u32,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        let defaults = ChunkConfig::default();
        Self {
            staging_dir: defaults.staging_dir,
            inactivity_window_secs: defaults.inactivity_window.as_secs(),
            sweep_interval_secs: defaults.sweep_interval.as_secs(),
            max_chunk_size: defaults.max_chunk_size,
            max_chunks: defaults.max_chunks,
        }
    }
}

impl ChunkSettings {
    pub fn to_chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            staging_dir: self.staging_dir.clone(),
            inactivity_window: Duration::from_secs(self.inactivity_window_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_chunk_size: self.max_chunk_size,
            max_chunks: self.max_chunks,
        }
    }
}

// =============================================================================
// Authentication
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub users: Vec<UserRecord>,
    /// Lifetime of issued tokens
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            token_ttl_secs: 3600,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Id this process registers under
    pub node_id: String,
    pub role: String,
    /// Address advertised to peers, defaults to the server address
    pub advertise_host: Option<String>,
    pub heartbeat_interval_secs: u64,
    /// Peers silent for longer than this are expired
    pub max_heartbeat_age_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            node_id: "gateway-1".to_string(),
            role: "gateway".to_string(),
            advertise_host: None,
            heartbeat_interval_secs: 10,
            max_heartbeat_age_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::StorageDriver;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_file_gets_defaults() {
        let config = GatewayConfig::from_yaml("{}").unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].kind, BackendKind::Local);
        assert_eq!(config.server.socket_addr().unwrap().port(), 9000);
        assert_eq!(config.auth.token_ttl_secs, 3600);
    }

    #[test]
    fn test_parse_backends() {
        let yaml = r#"
backends:
  - name: archive
    kind: memory
    path_prefix: /archive
  - name: vip
    kind: memory
    users: [alice]
    verify_mode: required
    checksum_algorithm: sha512
  - name: home
    root_path: /tmp/home
auth:
  users:
    - username: alice
      password: pw
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.backends.len(), 3);
        assert_matches!(config.backends[0].matcher().unwrap(), RouteMatcher::PathPrefix(_));
        assert_matches!(config.backends[1].matcher().unwrap(), RouteMatcher::Users(u) if u == vec!["alice"]);
        assert_eq!(config.backends[1].verify_mode, VerifyMode::Required);
        assert_eq!(config.backends[1].checksum_algorithm, ChecksumAlgorithm::Sha512);
        assert_matches!(config.backends[2].matcher().unwrap(), RouteMatcher::Any);
        assert_eq!(config.auth.users[0].username, "alice");
    }

    #[test]
    fn test_server_settings() {
        let config = GatewayConfig::from_yaml("{}").unwrap();
        assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.services, ServicesConfig::default());

        let yaml = "server:\n  shutdown_timeout_secs: 5\n  services:\n    registry: false\n";
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(5));
        assert!(!config.server.services.registry);
        assert!(config.server.services.meta);
    }

    #[test]
    fn test_invalid_configs() {
        let duplicate = "backends:\n  - name: a\n    kind: memory\n  - name: a\n    kind: memory\n";
        assert_matches!(GatewayConfig::from_yaml(duplicate), Err(Error::Configuration(_)));

        let exclusive = "backends:\n  - name: a\n    kind: memory\n    path_prefix: /x\n    users: [bob]\n";
        assert_matches!(GatewayConfig::from_yaml(exclusive), Err(Error::Configuration(_)));

        let bad_addr = "server:\n  addr: nowhere\n";
        assert_matches!(GatewayConfig::from_yaml(bad_addr), Err(Error::Configuration(_)));

        assert_matches!(GatewayConfig::from_yaml("backends: 7"), Err(Error::YamlParse(_)));
    }

    #[tokio::test]
    async fn test_build_local_route() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = BackendConfig {
            name: "disk".to_string(),
            root_path: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let route = backend.build_route().await.unwrap();
        assert_eq!(route.name, "disk");
        assert!(route.driver.health_check().await.unwrap());
    }
}
