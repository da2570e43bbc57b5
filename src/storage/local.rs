//! Local Filesystem Driver
//!
//! Publishes files into a per-user directory tree. Attributes that the
//! filesystem cannot hold (the content checksum) live in a sidecar mirror
//! tree with the same relative layout. Uploads stream into a temporary
//! directory on the same filesystem and are published with `rename`.
//!
//! ```text
//! <root>/data/<user>/docs/report.pdf      published bytes
//! <root>/meta/<user>/docs/report.pdf      sidecar JSON
//! <root>/tmp/<uuid>.upload                in-flight uploads
//! ```

use crate::checksum::{self, Checksum, ChecksumReader};
use crate::context::IdentityContext;
use crate::domain::path::NamespacePath;
use crate::domain::ports::{
    ByteStream, Capabilities, DataDriver, Download, FileInfo, MetaDataDriver, StorageDriver,
};
use crate::error::{Error, Result};
use crate::storage::{copy_limited, epoch_of, user_segment, TempFileGuard};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn, Instrument};

/// Number of lock stripes serializing publishes per path
const PATH_LOCK_STRIPES: usize = 64;

// =============================================================================
// Local Driver Configuration
// =============================================================================

/// Configuration for the local filesystem driver
#[derive(Debug, Clone)]
pub struct LocalDriverConfig {
    /// Backend name
    pub name: String,
    /// Root directory holding the data, sidecar and temp trees
    pub root_path: PathBuf,
    /// Temporary directory override, must be on the same filesystem
    pub temporary_path: Option<PathBuf>,
    /// Whether to fsync uploads before publishing
    pub sync_writes: bool,
    pub capabilities: Capabilities,
}

impl Default for LocalDriverConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            root_path: PathBuf::from("./data"),
            temporary_path: None,
            sync_writes: false,
            capabilities: Capabilities::default(),
        }
    }
}

// =============================================================================
// Sidecar Metadata
// =============================================================================

/// Attributes stored next to each published file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMetadata {
    checksum: Checksum,
    size: u64,
    /// Modification time of the data file this record describes, in nanoseconds
    data_mtime_ns: u64,
    uploaded_at: i64,
}

impl StoredMetadata {
    /// Whether this record still describes the file behind `meta`
    fn describes(&self, meta: &std::fs::Metadata) -> bool {
        self.size == meta.len() && self.data_mtime_ns == mtime_ns(meta)
    }
}

fn mtime_ns(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Local Driver
// =============================================================================

/// Filesystem-tree backend
pub struct LocalDriver {
    name: String,
    data_root: PathBuf,
    meta_root: PathBuf,
    temp_root: PathBuf,
    sync_writes: bool,
    capabilities: Capabilities,
    /// Per-user namespace locks: structural changes take write
    namespace_locks: DashMap<String, Arc<RwLock<()>>>,
    /// Publish/read consistency per (user, path)
    path_locks: Box<[Mutex<()>]>,
}

impl LocalDriver {
    /// Create a driver rooted at `root_path` with default settings
    pub async fn with_path(root_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(LocalDriverConfig {
            root_path: root_path.into(),
            ..Default::default()
        })
        .await
    }

    /// Create a driver, preparing its trees and purging stale temporary files
    pub async fn with_config(config: LocalDriverConfig) -> Result<Self> {
        let data_root = config.root_path.join("data");
        let meta_root = config.root_path.join("meta");
        let temp_root = config
            .temporary_path
            .clone()
            .unwrap_or_else(|| config.root_path.join("tmp"));

        fs::create_dir_all(&data_root).await?;
        fs::create_dir_all(&meta_root).await?;
        fs::create_dir_all(&temp_root).await?;

        let driver = Self {
            name: config.name,
            data_root,
            meta_root,
            temp_root,
            sync_writes: config.sync_writes,
            capabilities: config.capabilities,
            namespace_locks: DashMap::new(),
            path_locks: (0..PATH_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        };

        let purged = driver.purge_temporary().await?;
        info!(
            backend = %driver.name,
            root = %config.root_path.display(),
            purged,
            "Local driver initialized"
        );
        Ok(driver)
    }

    /// Remove leftovers from uploads interrupted by a previous process
    async fn purge_temporary(&self) -> Result<usize> {
        let mut purged = 0;
        let mut entries = fs::read_dir(&self.temp_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => purged += 1,
                Err(e) => warn!(
                    backend = %self.name,
                    file = %entry.path().display(),
                    "Failed to purge temporary file: {}",
                    e
                ),
            }
        }
        Ok(purged)
    }

    fn data_path(&self, user: &str, path: &NamespacePath) -> PathBuf {
        let home = self.data_root.join(user);
        if path.is_root() {
            home
        } else {
            home.join(path.relative())
        }
    }

    fn meta_path(&self, user: &str, path: &NamespacePath) -> PathBuf {
        let home = self.meta_root.join(user);
        if path.is_root() {
            home
        } else {
            home.join(path.relative())
        }
    }

    fn namespace_lock(&self, user: &str) -> Arc<RwLock<()>> {
        self.namespace_locks
            .entry(user.to_string())
            .or_default()
            .clone()
    }

    fn path_lock(&self, user: &str, path: &NamespacePath) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        user.hash(&mut hasher);
        path.hash(&mut hasher);
        &self.path_locks[(hasher.finish() as usize) % PATH_LOCK_STRIPES]
    }

    /// Ensure `path` can receive an upload: parent folder exists, target is not a folder
    async fn check_upload_target(&self, user: &str, path: &NamespacePath) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::BadInputData("cannot upload to the namespace root".into()))?;
        match stat(&self.data_path(user, &parent)).await? {
            None => return Err(Error::NotFound(parent.to_string())),
            Some(meta) if !meta.is_dir() => {
                return Err(Error::BadInputData(format!("{} is not a folder", parent)))
            }
            Some(_) => {}
        }
        if let Some(meta) = stat(&self.data_path(user, path)).await? {
            if meta.is_dir() {
                return Err(Error::BadInputData(format!("{} is a folder", path)));
            }
        }
        Ok(())
    }

    /// Build a snapshot of one entry. Caller holds the namespace read lock.
    async fn stat_entry(&self, user: &str, path: &NamespacePath) -> Result<FileInfo> {
        let data_path = self.data_path(user, path);
        let meta = stat(&data_path)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if meta.is_dir() {
            return Ok(FileInfo::folder(path.clone(), epoch_of(&meta)));
        }
        let checksum = self.load_checksum(user, path, &data_path, &meta).await?;
        Ok(FileInfo::file(path.clone(), meta.len(), epoch_of(&meta), checksum))
    }

    /// Checksum from the sidecar, recomputed when the sidecar is missing or stale
    async fn load_checksum(
        &self,
        user: &str,
        path: &NamespacePath,
        data_path: &Path,
        meta: &std::fs::Metadata,
    ) -> Result<Checksum> {
        if let Ok(raw) = fs::read(self.meta_path(user, path)).await {
            if let Ok(stored) = serde_json::from_slice::<StoredMetadata>(&raw) {
                if stored.describes(meta) {
                    return Ok(stored.checksum);
                }
            }
        }
        debug!(path = %path, "Sidecar missing or stale, recomputing checksum");
        let file = fs::File::open(data_path)
            .await
            .map_err(|e| Error::from_io_at(e, path.as_str()))?;
        checksum::compute(self.capabilities.checksum_algorithm, file).await
    }
}

/// `fs::metadata` with a missing path mapped to `None`
async fn stat(path: &Path) -> Result<Option<std::fs::Metadata>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

async fn remove_ignoring_missing(path: &Path, recursive: bool) -> Result<()> {
    let result = if recursive {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[async_trait]
impl DataDriver for LocalDriver {
    async fn upload_file(
        &self,
        ctx: &IdentityContext,
        path: &NamespacePath,
        stream: ByteStream,
        client_checksum: Option<&Checksum>,
    ) -> Result<FileInfo> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;
        let caps = &self.capabilities;
        caps.verify_mode.precheck(client_checksum)?;
        self.check_upload_target(username, path).await?;

        async move {
            let algorithm = caps
                .verify_mode
                .hashing_algorithm(client_checksum, caps.checksum_algorithm);
            let temp = TempFileGuard::new(
                self.temp_root
                    .join(format!("{}.upload", uuid::Uuid::new_v4().simple())),
            );

            let mut file = fs::File::create(temp.path()).await?;
            let mut reader = ChecksumReader::new(stream, algorithm);
            copy_limited(&mut reader, &mut file, caps.max_file_size).await?;
            if self.sync_writes {
                file.sync_all().await?;
            }
            drop(file);

            let (computed, size) = reader.finish();
            if let Err(e) = caps.verify_mode.verify(client_checksum, &computed) {
                warn!(path = %path, computed = %computed, "Upload rejected: {}", e);
                return Err(e);
            }

            let temp_meta = fs::metadata(temp.path()).await?;
            let stored = StoredMetadata {
                checksum: computed.clone(),
                size,
                data_mtime_ns: mtime_ns(&temp_meta),
                uploaded_at: Utc::now().timestamp(),
            };
            let sidecar = TempFileGuard::new(temp.path().with_extension("meta"));
            fs::write(sidecar.path(), serde_json::to_vec(&stored)?).await?;

            // Publish
            let ns = self.namespace_lock(username);
            let _ns = ns.read().await;
            let _path = self.path_lock(username, path).lock().await;
            self.check_upload_target(username, path).await?;

            let data_path = self.data_path(username, path);
            let meta_path = self.meta_path(username, path);
            if let Some(parent) = meta_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(temp.path(), &data_path).await?;
            temp.disarm();
            match fs::rename(sidecar.path(), &meta_path).await {
                Ok(()) => sidecar.disarm(),
                // Published bytes win; the stale sidecar is detected and recomputed
                Err(e) => warn!(path = %path, "Failed to publish sidecar: {}", e),
            }

            debug!(path = %path, size, checksum = %computed, "File published");
            Ok(FileInfo::file(path.clone(), size, epoch_of(&temp_meta), computed))
        }
        .instrument(ctx.span().clone())
        .await
    }

    async fn download_file(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<Download> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;

        let ns = self.namespace_lock(username);
        let _ns = ns.read().await;
        let _path = self.path_lock(username, path).lock().await;

        let info = self.stat_entry(username, path).await?;
        if info.folder {
            return Err(Error::BadInputData(format!("{} is a folder", path)));
        }
        // The open handle keeps reading these bytes even if a later publish replaces the path
        let file = fs::File::open(self.data_path(username, path))
            .await
            .map_err(|e| Error::from_io_at(e, path.as_str()))?;
        Ok(Download {
            info,
            stream: Box::pin(file),
        })
    }
}

#[async_trait]
impl MetaDataDriver for LocalDriver {
    async fn examine(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<FileInfo> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;

        let ns = self.namespace_lock(username);
        let _ns = ns.read().await;
        let _path = self.path_lock(username, path).lock().await;
        self.stat_entry(username, path).await
    }

    async fn list_folder(
        &self,
        ctx: &IdentityContext,
        path: &NamespacePath,
    ) -> Result<Vec<FileInfo>> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;

        let ns = self.namespace_lock(username);
        let _ns = ns.read().await;

        let folder = self.data_path(username, path);
        match stat(&folder).await? {
            None => return Err(Error::NotFound(path.to_string())),
            Some(meta) if !meta.is_dir() => {
                return Err(Error::BadInputData(format!("{} is not a folder", path)))
            }
            Some(_) => {}
        }

        let mut children = Vec::new();
        let mut entries = fs::read_dir(&folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(folder = %path, "Skipping entry with non UTF-8 name");
                continue;
            };
            match path.join(name) {
                Ok(child) => children.push(child),
                Err(_) => warn!(folder = %path, name, "Skipping entry with invalid name"),
            }
        }
        children.sort();

        let mut infos = Vec::with_capacity(children.len());
        for child in children {
            let _path = self.path_lock(username, &child).lock().await;
            match self.stat_entry(username, &child).await {
                Ok(info) => infos.push(info),
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(infos)
    }

    async fn move_entry(
        &self,
        ctx: &IdentityContext,
        source: &NamespacePath,
        target: &NamespacePath,
    ) -> Result<()> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;
        if source.is_root() || target.is_root() {
            return Err(Error::BadInputData("cannot move the namespace root".into()));
        }
        if source == target {
            return Ok(());
        }
        if source.is_ancestor_of(target) {
            return Err(Error::BadInputData(format!(
                "cannot move {} into its own descendant {}",
                source, target
            )));
        }

        let ns = self.namespace_lock(username);
        let _ns = ns.write().await;

        let src_data = self.data_path(username, source);
        let src_meta = stat(&src_data)
            .await?
            .ok_or_else(|| Error::NotFound(source.to_string()))?;

        let target_parent = target.parent().unwrap_or_else(NamespacePath::root);
        match stat(&self.data_path(username, &target_parent)).await? {
            None => return Err(Error::NotFound(target_parent.to_string())),
            Some(meta) if !meta.is_dir() => {
                return Err(Error::BadInputData(format!("{} is not a folder", target_parent)))
            }
            Some(_) => {}
        }

        let tgt_data = self.data_path(username, target);
        if let Some(existing) = stat(&tgt_data).await? {
            if existing.is_dir() || src_meta.is_dir() {
                return Err(Error::BadInputData(format!("{} already exists", target)));
            }
        }

        fs::rename(&src_data, &tgt_data).await?;

        let src_side = self.meta_path(username, source);
        let tgt_side = self.meta_path(username, target);
        if stat(&src_side).await?.is_some() {
            if let Some(parent) = tgt_side.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&src_side, &tgt_side).await?;
        } else {
            remove_ignoring_missing(&tgt_side, false).await?;
        }

        info!(parent: ctx.span(), source = %source, target = %target, "Entry moved");
        Ok(())
    }

    async fn delete(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<()> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;
        if path.is_root() {
            return Err(Error::BadInputData("cannot delete the namespace root".into()));
        }

        let ns = self.namespace_lock(username);
        let _ns = ns.write().await;

        let data_path = self.data_path(username, path);
        let meta = stat(&data_path)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let recursive = meta.is_dir();
        remove_ignoring_missing(&data_path, recursive).await?;
        remove_ignoring_missing(&self.meta_path(username, path), recursive).await?;

        info!(parent: ctx.span(), path = %path, recursive, "Entry deleted");
        Ok(())
    }

    async fn create_folder(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<()> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;
        if path.is_root() {
            return Err(Error::BadInputData("the namespace root already exists".into()));
        }

        let ns = self.namespace_lock(username);
        let _ns = ns.write().await;

        let data_path = self.data_path(username, path);
        if stat(&data_path).await?.is_some() {
            return Err(Error::BadInputData(format!("{} already exists", path)));
        }
        let parent = path.parent().unwrap_or_else(NamespacePath::root);
        match stat(&self.data_path(username, &parent)).await? {
            None => return Err(Error::NotFound(parent.to_string())),
            Some(meta) if !meta.is_dir() => {
                return Err(Error::BadInputData(format!("{} is not a folder", parent)))
            }
            Some(_) => {}
        }

        fs::create_dir(&data_path).await?;
        fs::create_dir_all(self.meta_path(username, path)).await?;
        debug!(parent: ctx.span(), path = %path, "Folder created");
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn init_home(&self, ctx: &IdentityContext) -> Result<()> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;
        let root = NamespacePath::root();
        fs::create_dir_all(self.data_path(username, &root)).await?;
        fs::create_dir_all(self.meta_path(username, &root)).await?;
        debug!(parent: ctx.span(), backend = %self.name, "Home directory ready");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let marker = self.temp_root.join(".health_check");
        match fs::write(&marker, b"ok").await {
            Ok(_) => {
                let _ = fs::remove_file(&marker).await;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}
