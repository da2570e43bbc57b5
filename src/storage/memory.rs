//! In-Memory Row Driver
//!
//! Relational-style backend: every namespace entry is one row keyed by
//! `(user, path)` in an ordered table. Publishing a file is a single row
//! write under the table lock, so readers see either the previous row or
//! the new one.

use crate::checksum::{Checksum, ChecksumReader};
use crate::context::IdentityContext;
use crate::domain::path::NamespacePath;
use crate::domain::ports::{
    ByteStream, Capabilities, DataDriver, Download, FileInfo, MetaDataDriver, StorageDriver,
};
use crate::error::{Error, Result};
use crate::storage::{copy_limited, user_segment};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, warn};

// =============================================================================
// Memory Driver Configuration
// =============================================================================

/// Configuration for the in-memory driver
#[derive(Debug, Clone)]
pub struct MemoryDriverConfig {
    /// Backend name
    pub name: String,
    pub capabilities: Capabilities,
}

impl Default for MemoryDriverConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            capabilities: Capabilities::default(),
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

type RowKey = (String, NamespacePath);

#[derive(Debug, Clone)]
struct Row {
    folder: bool,
    modified: i64,
    checksum: Option<Checksum>,
    blob: Bytes,
}

impl Row {
    fn folder() -> Self {
        Self {
            folder: true,
            modified: Utc::now().timestamp(),
            checksum: None,
            blob: Bytes::new(),
        }
    }

    fn info(&self, path: &NamespacePath) -> FileInfo {
        match &self.checksum {
            Some(checksum) if !self.folder => FileInfo::file(
                path.clone(),
                self.blob.len() as u64,
                self.modified,
                checksum.clone(),
            ),
            _ => FileInfo::folder(path.clone(), self.modified),
        }
    }
}

fn key(user: &str, path: &NamespacePath) -> RowKey {
    (user.to_string(), path.clone())
}

/// Require `path` to be an existing folder row
fn require_folder(rows: &BTreeMap<RowKey, Row>, user: &str, path: &NamespacePath) -> Result<()> {
    match rows.get(&key(user, path)) {
        None => Err(Error::NotFound(path.to_string())),
        Some(row) if !row.folder => Err(Error::BadInputData(format!("{} is not a folder", path))),
        Some(_) => Ok(()),
    }
}

/// Keys of `path` and everything below it
fn subtree(rows: &BTreeMap<RowKey, Row>, user: &str, path: &NamespacePath) -> Vec<RowKey> {
    rows.range(key(user, path)..)
        .take_while(|((u, _), _)| u == user)
        .filter(|((_, p), _)| p == path || path.is_ancestor_of(p))
        .map(|(k, _)| k.clone())
        .collect()
}

// =============================================================================
// Memory Driver
// =============================================================================

/// Ordered row table backend
pub struct MemoryDriver {
    name: String,
    capabilities: Capabilities,
    rows: RwLock<BTreeMap<RowKey, Row>>,
}

impl MemoryDriver {
    /// Create new memory driver with default config
    pub fn new() -> Self {
        Self::with_config(MemoryDriverConfig::default())
    }

    pub fn with_config(config: MemoryDriverConfig) -> Self {
        Self {
            name: config.name,
            capabilities: config.capabilities,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Total number of rows across all namespaces
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    fn check_upload_target(&self, user: &str, path: &NamespacePath) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::BadInputData("cannot upload to the namespace root".into()))?;
        let rows = self.rows.read();
        require_folder(&rows, user, &parent)?;
        if rows.get(&key(user, path)).is_some_and(|r| r.folder) {
            return Err(Error::BadInputData(format!("{} is a folder", path)));
        }
        Ok(())
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataDriver for MemoryDriver {
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
        self.check_upload_target(username, path)?;

        let algorithm = caps
            .verify_mode
            .hashing_algorithm(client_checksum, caps.checksum_algorithm);
        let mut reader = ChecksumReader::new(stream, algorithm);
        let mut buffer = Vec::new();
        copy_limited(&mut reader, &mut buffer, caps.max_file_size).await?;
        let (computed, size) = reader.finish();
        if let Err(e) = caps.verify_mode.verify(client_checksum, &computed) {
            warn!(parent: ctx.span(), path = %path, computed = %computed, "Upload rejected: {}", e);
            return Err(e);
        }

        let row = Row {
            folder: false,
            modified: Utc::now().timestamp(),
            checksum: Some(computed),
            blob: Bytes::from(buffer),
        };
        let info = row.info(path);

        {
            let mut rows = self.rows.write();
            let parent = path.parent().unwrap_or_else(NamespacePath::root);
            require_folder(&rows, username, &parent)?;
            if rows.get(&key(username, path)).is_some_and(|r| r.folder) {
                return Err(Error::BadInputData(format!("{} is a folder", path)));
            }
            rows.insert(key(username, path), row);
        }

        debug!(parent: ctx.span(), path = %path, size, "Row published");
        Ok(info)
    }

    async fn download_file(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<Download> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;

        let rows = self.rows.read();
        let row = rows
            .get(&key(username, path))
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if row.folder {
            return Err(Error::BadInputData(format!("{} is a folder", path)));
        }
        Ok(Download {
            info: row.info(path),
            stream: Box::pin(std::io::Cursor::new(row.blob.clone())),
        })
    }
}

#[async_trait]
impl MetaDataDriver for MemoryDriver {
    async fn examine(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<FileInfo> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;
        self.rows
            .read()
            .get(&key(username, path))
            .map(|row| row.info(path))
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn list_folder(
        &self,
        ctx: &IdentityContext,
        path: &NamespacePath,
    ) -> Result<Vec<FileInfo>> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;

        let rows = self.rows.read();
        require_folder(&rows, username, path)?;
        Ok(rows
            .range(key(username, path)..)
            .take_while(|((u, _), _)| u == username)
            .filter(|((_, p), _)| p.parent().as_ref() == Some(path))
            .map(|((_, p), row)| row.info(p))
            .collect())
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

        let mut rows = self.rows.write();
        let source_is_folder = rows
            .get(&key(username, source))
            .map(|r| r.folder)
            .ok_or_else(|| Error::NotFound(source.to_string()))?;
        let target_parent = target.parent().unwrap_or_else(NamespacePath::root);
        require_folder(&rows, username, &target_parent)?;
        if let Some(existing) = rows.get(&key(username, target)) {
            if existing.folder || source_is_folder {
                return Err(Error::BadInputData(format!("{} already exists", target)));
            }
        }

        let moved: Vec<(NamespacePath, Row)> = subtree(&rows, username, source)
            .into_iter()
            .filter_map(|k| {
                let row = rows.remove(&k)?;
                let rebased = k.1.rebase(source, target)?;
                Some((rebased, row))
            })
            .collect();
        for (path, row) in moved {
            rows.insert((username.to_string(), path), row);
        }

        debug!(parent: ctx.span(), source = %source, target = %target, "Rows moved");
        Ok(())
    }

    async fn delete(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<()> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;
        if path.is_root() {
            return Err(Error::BadInputData("cannot delete the namespace root".into()));
        }

        let mut rows = self.rows.write();
        let doomed = subtree(&rows, username, path);
        if doomed.is_empty() {
            return Err(Error::NotFound(path.to_string()));
        }
        for k in &doomed {
            rows.remove(k);
        }
        debug!(parent: ctx.span(), path = %path, rows = doomed.len(), "Rows deleted");
        Ok(())
    }

    async fn create_folder(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<()> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;
        if path.is_root() {
            return Err(Error::BadInputData("the namespace root already exists".into()));
        }

        let mut rows = self.rows.write();
        if rows.contains_key(&key(username, path)) {
            return Err(Error::BadInputData(format!("{} already exists", path)));
        }
        let parent = path.parent().unwrap_or_else(NamespacePath::root);
        require_folder(&rows, username, &parent)?;
        rows.insert(key(username, path), Row::folder());
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn init_home(&self, ctx: &IdentityContext) -> Result<()> {
        let user = ctx.require_user()?;
        let username = user_segment(&user.username)?;
        self.rows
            .write()
            .entry(key(username, &NamespacePath::root()))
            .or_insert_with(Row::folder);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
