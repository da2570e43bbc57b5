//! Domain Ports - Core trait definitions for the gateway
//!
//! These traits define the boundaries between the storage core and its
//! backends and collaborators. Backends implement the driver traits; the
//! HTTP layer and the chunk assembler only ever talk to them through the
//! [`StorageFacade`](crate::storage::StorageFacade).

use crate::checksum::{Checksum, ChecksumAlgorithm};
use crate::context::IdentityContext;
use crate::domain::path::NamespacePath;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Readable byte stream moving through the data plane
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

// =============================================================================
// Identity
// =============================================================================

/// Acting identity on whose behalf an operation executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Unique within a backend
    pub username: String,
    pub email: String,
    pub display_name: String,
    /// Backend-specific attributes
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            email: String::new(),
            display_name: username.clone(),
            username,
            extra: BTreeMap::new(),
        }
    }
}

/// Turns an opaque credential into an identity
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a bearer credential.
    ///
    /// Fails with `Unauthenticated` for an empty credential, `InvalidToken`
    /// when malformed or expired, `BadAuthenticationData` when rejected, and
    /// `UserNotFound` when the backing user record is gone.
    async fn resolve(&self, credential: &str) -> Result<Arc<User>>;
}

// =============================================================================
// File Info
// =============================================================================

/// Snapshot of one namespace entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: NamespacePath,
    pub folder: bool,
    /// Size in bytes, 0 for folders
    pub size: u64,
    /// Last modification, Unix epoch seconds
    pub modified: i64,
    /// Content checksum, absent for folders
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FileInfo {
    pub fn folder(path: NamespacePath, modified: i64) -> Self {
        Self {
            path,
            folder: true,
            size: 0,
            modified,
            checksum: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn file(path: NamespacePath, size: u64, modified: i64, checksum: Checksum) -> Self {
        Self {
            path,
            folder: false,
            size,
            modified,
            checksum: Some(checksum),
            extra: BTreeMap::new(),
        }
    }
}

/// A download: the published bytes and the snapshot they belong to
pub struct Download {
    pub info: FileInfo,
    pub stream: ByteStream,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download").field("info", &self.info).finish()
    }
}

// =============================================================================
// Checksum Verification Policy
// =============================================================================

/// How a backend treats client-declared checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Ignore client checksums
    Off,
    /// Verify when declared; `none` opts out
    #[default]
    IfPresent,
    /// A real client checksum is mandatory
    Required,
}

impl VerifyMode {
    /// Validate the declared checksum before any byte is written
    pub fn precheck(&self, client: Option<&Checksum>) -> Result<()> {
        match (self, client) {
            (VerifyMode::Required, None) => Err(Error::BadInputData(
                "a client checksum is required by this backend".into(),
            )),
            (VerifyMode::Required, Some(c)) if c.is_none() => Err(Error::BadChecksum {
                expected: c.to_string(),
                computed: "verification is mandatory".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Algorithm the server must hash with so the declared checksum can be verified
    pub fn hashing_algorithm(
        &self,
        client: Option<&Checksum>,
        default: ChecksumAlgorithm,
    ) -> ChecksumAlgorithm {
        match (self, client) {
            (VerifyMode::Off, _) | (_, None) => default,
            (_, Some(c)) if c.is_none() => default,
            (_, Some(c)) => c.algorithm(),
        }
    }

    /// Compare the declared checksum to the computed one
    pub fn verify(&self, client: Option<&Checksum>, computed: &Checksum) -> Result<()> {
        let declared = match (self, client) {
            (VerifyMode::Off, _) | (_, None) => return Ok(()),
            (VerifyMode::IfPresent, Some(c)) if c.is_none() => return Ok(()),
            (_, Some(c)) => c,
        };
        if crate::checksum::verify(declared, computed) {
            Ok(())
        } else {
            Err(Error::BadChecksum {
                expected: declared.to_string(),
                computed: computed.to_string(),
            })
        }
    }
}

// =============================================================================
// Storage Driver Ports
// =============================================================================

/// What a backend supports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Create the user's home root when they first log in
    pub create_home_dir: bool,
    /// Client checksum policy
    pub verify_mode: VerifyMode,
    /// Algorithm used for server-side checksums
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Largest single file accepted, 0 for unlimited
    pub max_file_size: u64,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            create_home_dir: true,
            verify_mode: VerifyMode::IfPresent,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            max_file_size: 0,
        }
    }
}

/// Data plane: raw byte transfer
#[async_trait]
pub trait DataDriver: Send + Sync {
    /// Stream `stream` into a temporary location, then atomically publish it at `path`
    async fn upload_file(
        &self,
        ctx: &IdentityContext,
        path: &NamespacePath,
        stream: ByteStream,
        client_checksum: Option<&Checksum>,
    ) -> Result<FileInfo>;

    /// Open the currently published bytes at `path`
    async fn download_file(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<Download>;
}

/// Metadata plane: namespace, attributes, listing
#[async_trait]
pub trait MetaDataDriver: Send + Sync {
    async fn examine(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<FileInfo>;

    /// Direct children of `path`, ordered by path
    async fn list_folder(&self, ctx: &IdentityContext, path: &NamespacePath)
        -> Result<Vec<FileInfo>>;

    /// Move (recursively for folders)
    async fn move_entry(
        &self,
        ctx: &IdentityContext,
        source: &NamespacePath,
        target: &NamespacePath,
    ) -> Result<()>;

    /// Delete (recursively for folders)
    async fn delete(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<()>;

    async fn create_folder(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<()>;
}

/// A complete backend: data and metadata drivers over one namespace
#[async_trait]
pub trait StorageDriver: DataDriver + MetaDataDriver {
    /// Backend name for logs and metrics
    fn name(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    /// Idempotently create the identity's home root
    async fn init_home(&self, ctx: &IdentityContext) -> Result<()>;

    /// Check if backend is healthy
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Registry Port
// =============================================================================

/// A gateway instance advertising itself for discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryNode {
    pub id: String,
    pub role: String,
    pub system_version: String,
    pub host: String,
}

/// Port for node discovery backends
#[async_trait]
pub trait RegistryDriver: Send + Sync {
    /// Upsert by id
    async fn register(&self, node: RegistryNode) -> Result<()>;

    async fn unregister(&self, id: &str) -> Result<()>;

    /// Live nodes advertising `role`, in registration order
    async fn nodes_for_role(&self, role: &str) -> Result<Vec<RegistryNode>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageDriverRef = Arc<dyn StorageDriver>;
pub type IdentityResolverRef = Arc<dyn IdentityResolver>;
pub type RegistryDriverRef = Arc<dyn RegistryDriver>;
