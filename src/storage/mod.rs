//! Storage Backends
//!
//! Concrete data + metadata drivers and the facade that routes requests to
//! them:
//! - [`LocalDriver`]: filesystem tree with a sidecar metadata mirror
//! - [`MemoryDriver`]: ordered row table, the relational-style backend
//! - [`StorageFacade`]: predicate-routed entry point used by handlers

mod facade;
mod local;
mod memory;

pub use facade::{BackendRoute, RouteMatcher, StorageFacade};
pub use local::{LocalDriver, LocalDriverConfig};
pub use memory::{MemoryDriver, MemoryDriverConfig};

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Buffer size for streaming copies
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Copy `reader` into `writer`, failing with `TooBig` past `limit` bytes (0 = unlimited)
pub(crate) async fn copy_limited<R, W>(reader: &mut R, writer: &mut W, limit: u64) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        if limit > 0 && total > limit {
            return Err(Error::TooBig { limit });
        }
        writer.write_all(&buf[..n]).await?;
    }
    writer.flush().await?;
    Ok(total)
}

/// Removes a temporary file when dropped unless disarmed.
///
/// Covers every exit path of an upload, including the future being dropped
/// mid-stream when the client goes away.
#[derive(Debug)]
pub(crate) struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub(crate) fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// The file has been published; leave it alone
    pub(crate) fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Modification time of a file as Unix epoch seconds
pub(crate) fn epoch_of(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp())
        .unwrap_or_else(|_| chrono::Utc::now().timestamp())
}

/// Validate a username for use as a namespace key or directory name
pub(crate) fn user_segment(username: &str) -> Result<&str> {
    if username.is_empty()
        || username == "."
        || username == ".."
        || username.contains(['/', '\\', '\0'])
    {
        return Err(Error::BadInputData(format!("invalid username: {:?}", username)));
    }
    Ok(username)
}
