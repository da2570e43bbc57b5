//! Sync Gateway - File synchronization and sharing core
//!
//! A storage gateway exposing upload, download, examine, list, move, delete
//! and create-folder over HTTP, backed by pluggable storage backends, with
//! resumable chunked uploads and end-to-end checksum verification.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         REST API (axum)                             │
//! │      auth/token · data · transfers · meta · registry · metrics      │
//! ├──────────────────────────────┬──────────────────────────────────────┤
//! │      Token Authority         │          Chunk Assembler             │
//! │  (bearer → IdentityContext)  │  (staging, completion, sweeping)     │
//! ├──────────────────────────────┴──────────────────────────────────────┤
//! │                        Storage Facade                               │
//! │               (predicate routing, metrics, logging)                 │
//! ├─────────────────────────────────┬───────────────────────────────────┤
//! │          LocalDriver            │           MemoryDriver            │
//! │  (filesystem + sidecar meta)    │      (ordered row table)          │
//! └─────────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`api`]: REST router and server
//! - [`auth`]: user store and bearer tokens
//! - [`checksum`]: checksum values, hashing and streaming verification
//! - [`chunk`]: chunked transfer assembly
//! - [`storage`]: backend drivers and the routing facade
//! - [`registry`]: node discovery
//! - [`domain`]: core types and driver traits
//! - [`error`]: error types and codes
//! - [`logging`]: application and access log sinks

pub mod api;
pub mod auth;
pub mod checksum;
pub mod chunk;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod storage;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, AppState, RestRouter};

pub use auth::{IssuedToken, TokenAuthority, UserRecord, UserStore};

pub use checksum::{Checksum, ChecksumAlgorithm};

pub use chunk::{ChunkAssembler, ChunkConfig, ChunkDescriptor, ChunkOutcome, TransferStatus};

pub use config::GatewayConfig;

pub use context::IdentityContext;

pub use domain::{
    ByteStream, Capabilities, DataDriver, Download, FileInfo, IdentityResolver, MetaDataDriver,
    NamespacePath, RegistryDriver, RegistryNode, StorageDriver, User, VerifyMode,
};

pub use error::{Error, ErrorCode, Result};

pub use gateway::Gateway;

pub use metrics::GatewayMetrics;

pub use storage::{BackendRoute, LocalDriver, MemoryDriver, RouteMatcher, StorageFacade};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
