//! Chunk Assembler
//!
//! Transfers are keyed by `(user, transfer id)`; each holds an async mutex
//! over its bookkeeping. Chunk bytes stream into the shared `incoming`
//! directory without that lock, so parallel chunk streams of one transfer
//! proceed concurrently. Only the rename into the transfer's slot, the
//! completeness check and finalization run under the lock.
//!
//! ```text
//! <staging>/incoming/<uuid>.part        chunk bytes while streaming
//! <staging>/<uuid>/slot-000000          committed slots of one transfer
//! ```

use crate::checksum::Checksum;
use crate::chunk::{ChunkDescriptor, ChunkOutcome, TransferState, TransferStatus};
use crate::context::IdentityContext;
use crate::domain::path::NamespacePath;
use crate::domain::ports::{ByteStream, FileInfo};
use crate::error::{Error, Result};
use crate::metrics::outcome;
use crate::storage::{copy_limited, StorageFacade, TempFileGuard};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn, Instrument};

const INCOMING_DIR: &str = "incoming";

/// Attempts to commit a staged chunk when its transfer keeps expiring underneath
const COMMIT_ATTEMPTS: usize = 3;

// =============================================================================
// Chunk Configuration
// =============================================================================

/// Configuration for chunked transfers
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Private staging root, purged on startup
    pub staging_dir: PathBuf,
    /// Idle time after which a transfer expires
    pub inactivity_window: Duration,
    /// How often the sweeper looks for idle transfers
    pub sweep_interval: Duration,
    /// Largest accepted chunk, 0 for unlimited
    pub max_chunk_size: u64,
    /// Largest accepted chunk total, 0 for unlimited
    pub max_chunks: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("./data/staging"),
            inactivity_window: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            max_chunk_size: 64 * 1024 * 1024, // 64 MB
            max_chunks: 10_000,
        }
    }
}

// =============================================================================
// Transfers
// =============================================================================

type TransferKey = (String, String);

/// Mutable bookkeeping of one transfer
#[derive(Debug)]
struct ChunkSet {
    state: TransferState,
    /// index -> staged byte length
    slots: BTreeMap<u32, u64>,
    /// Whole-file checksum, latest declared wins
    client_checksum: Option<Checksum>,
    last_activity: Instant,
}

/// One in-flight transfer
#[derive(Debug)]
struct Transfer {
    id: String,
    path: NamespacePath,
    total: u32,
    staging: PathBuf,
    created_at: DateTime<Utc>,
    /// Chunks currently streaming into `incoming` for this transfer
    streaming: AtomicUsize,
    set: Mutex<ChunkSet>,
}

impl Transfer {
    fn new(id: String, path: NamespacePath, total: u32, staging: PathBuf) -> Self {
        Self {
            id,
            path,
            total,
            staging,
            created_at: Utc::now(),
            streaming: AtomicUsize::new(0),
            set: Mutex::new(ChunkSet {
                state: TransferState::Open,
                slots: BTreeMap::new(),
                client_checksum: None,
                last_activity: Instant::now(),
            }),
        }
    }

    fn slot_path(&self, index: u32) -> PathBuf {
        slot_path(&self.staging, index)
    }

    fn check_matches(&self, path: &NamespacePath, total: u32) -> Result<()> {
        if self.path != *path || self.total != total {
            return Err(Error::BadInputData(format!(
                "transfer {} targets {} with {} chunks",
                self.id, self.path, self.total
            )));
        }
        Ok(())
    }
}

/// Marks a chunk stream in progress; the sweeper leaves the transfer alone
/// until every guard is dropped.
struct StreamingGuard(Arc<Transfer>);

impl StreamingGuard {
    fn begin(transfer: Arc<Transfer>) -> Self {
        transfer.streaming.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut set) = transfer.set.try_lock() {
            set.last_activity = Instant::now();
        }
        Self(transfer)
    }
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        self.0.streaming.fetch_sub(1, Ordering::AcqRel);
    }
}

fn slot_path(staging: &Path, index: u32) -> PathBuf {
    staging.join(format!("slot-{:06}", index))
}

// =============================================================================
// Chunk Assembler
// =============================================================================

/// Stages chunks and publishes complete sets through the storage facade
pub struct ChunkAssembler {
    config: ChunkConfig,
    facade: Arc<StorageFacade>,
    transfers: DashMap<TransferKey, Arc<Transfer>>,
    incoming: PathBuf,
}

impl ChunkAssembler {
    /// Create the assembler, discarding staging left by a previous process
    pub async fn new(config: ChunkConfig, facade: Arc<StorageFacade>) -> Result<Self> {
        let purged = purge_dir(&config.staging_dir).await?;
        let incoming = config.staging_dir.join(INCOMING_DIR);
        fs::create_dir_all(&incoming).await?;

        info!(
            staging = %config.staging_dir.display(),
            purged,
            inactivity_secs = config.inactivity_window.as_secs(),
            "Chunk assembler initialized"
        );
        Ok(Self {
            config,
            facade,
            transfers: DashMap::new(),
            incoming,
        })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Number of transfers currently tracked
    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// Accept one chunk.
    ///
    /// Returns `Completed` to exactly one deliverer per set: the one whose
    /// chunk made the set complete and whose publish succeeded.
    pub async fn deliver(
        &self,
        ctx: &IdentityContext,
        path: &str,
        descriptor: ChunkDescriptor,
        stream: ByteStream,
        client_checksum: Option<&Checksum>,
    ) -> Result<ChunkOutcome> {
        let user = ctx.require_user()?;
        let path = NamespacePath::parse(path)?;
        descriptor.validate(self.config.max_chunks)?;
        if path.is_root() {
            return Err(Error::BadInputData("cannot upload to the namespace root".into()));
        }
        self.facade.resolve(ctx, &path)?;

        let key: TransferKey = (user.username.clone(), descriptor.transfer_id.clone());
        let existing = self.transfers.get(&key).map(|entry| entry.value().clone());
        if let Some(existing) = &existing {
            existing.check_matches(&path, descriptor.total)?;
        }

        async move {
            if descriptor.total == 1 {
                self.facade.metrics().chunks_received.inc();
                let info = self
                    .facade
                    .upload_file(ctx, path.as_str(), stream, client_checksum)
                    .await?;
                return Ok(ChunkOutcome::Completed(info));
            }

            // Stream the chunk without holding the transfer lock
            let _streaming = existing.map(StreamingGuard::begin);
            let incoming = TempFileGuard::new(
                self.incoming
                    .join(format!("{}.part", uuid::Uuid::new_v4().simple())),
            );
            let mut file = fs::File::create(incoming.path()).await?;
            let mut stream = stream;
            let len = copy_limited(&mut stream, &mut file, self.config.max_chunk_size).await?;
            drop(file);

            for _ in 0..COMMIT_ATTEMPTS {
                let transfer = self.open_transfer(&key, &path, descriptor.total)?;
                let mut set = transfer.set.lock().await;
                if set.state.is_terminal() {
                    // Expired or finished while this chunk was streaming
                    drop(set);
                    self.transfers
                        .remove_if(&key, |_, t| Arc::ptr_eq(t, &transfer));
                    continue;
                }

                fs::create_dir_all(&transfer.staging).await?;
                fs::rename(incoming.path(), transfer.slot_path(descriptor.index)).await?;
                incoming.disarm();

                set.slots.insert(descriptor.index, len);
                set.last_activity = Instant::now();
                set.state = TransferState::Assembling;
                if let Some(checksum) = client_checksum {
                    set.client_checksum = Some(checksum.clone());
                }
                self.facade.metrics().chunks_received.inc();

                let received = set.slots.len() as u32;
                if received < transfer.total {
                    debug!(
                        transfer = %transfer.id,
                        index = descriptor.index,
                        received,
                        total = transfer.total,
                        "Chunk staged"
                    );
                    return Ok(ChunkOutcome::Pending {
                        received,
                        total: transfer.total,
                    });
                }

                set.state = TransferState::Finalizing;
                let published = self.finalize(ctx, &transfer, &set).await;
                let terminal = match &published {
                    Ok(_) => TransferState::Done,
                    Err(e) => {
                        warn!(transfer = %transfer.id, path = %transfer.path, "Transfer aborted: {}", e);
                        TransferState::Aborted
                    }
                };
                self.release(&key, &transfer, &mut set, terminal).await;
                return published.map(ChunkOutcome::Completed);
            }

            Err(Error::Internal(format!(
                "transfer {} expired repeatedly while committing a chunk",
                descriptor.transfer_id
            )))
        }
        .instrument(ctx.span().clone())
        .await
    }

    /// Client-initiated abort; `NotFound` for unknown or finished transfers
    pub async fn abort(&self, ctx: &IdentityContext, transfer_id: &str) -> Result<()> {
        let (key, transfer) = self.lookup(ctx, transfer_id)?;
        let mut set = transfer.set.lock().await;
        if set.state.is_terminal() {
            return Err(Error::NotFound(format!("transfer {}", transfer_id)));
        }
        self.release(&key, &transfer, &mut set, TransferState::Aborted)
            .await;
        info!(parent: ctx.span(), transfer = %transfer_id, "Transfer aborted by client");
        Ok(())
    }

    /// Snapshot of a transfer for resuming clients
    pub async fn status(&self, ctx: &IdentityContext, transfer_id: &str) -> Result<TransferStatus> {
        let (_, transfer) = self.lookup(ctx, transfer_id)?;
        let set = transfer.set.lock().await;
        if set.state.is_terminal() {
            return Err(Error::NotFound(format!("transfer {}", transfer_id)));
        }
        Ok(TransferStatus {
            transfer_id: transfer.id.clone(),
            path: transfer.path.clone(),
            total: transfer.total,
            received: set.slots.keys().copied().collect(),
            state: set.state,
            created_at: transfer.created_at,
        })
    }

    /// Expire transfers idle past the inactivity window.
    ///
    /// Transfers whose lock is held are being delivered to or finalized and
    /// are skipped, as are transfers with a chunk still streaming in.
    pub async fn sweep(&self) -> usize {
        let candidates: Vec<(TransferKey, Arc<Transfer>)> = self
            .transfers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut expired = 0;
        for (key, transfer) in candidates {
            let Ok(mut set) = transfer.set.try_lock() else {
                continue;
            };
            if set.state.is_terminal()
                || transfer.streaming.load(Ordering::Acquire) > 0
                || set.last_activity.elapsed() < self.config.inactivity_window
            {
                continue;
            }
            debug!(transfer = %transfer.id, user = %key.0, "Transfer expired");
            self.release(&key, &transfer, &mut set, TransferState::Expired)
                .await;
            expired += 1;
        }
        expired
    }

    /// Run [`sweep`](Self::sweep) periodically until shutdown
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.sweep_interval.max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = self.sweep().await;
                        if expired > 0 {
                            info!(expired, "Expired idle chunked transfers");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Chunk sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lookup(&self, ctx: &IdentityContext, transfer_id: &str) -> Result<(TransferKey, Arc<Transfer>)> {
        let user = ctx.require_user()?;
        let key = (user.username.clone(), transfer_id.to_string());
        let transfer = self
            .transfers
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("transfer {}", transfer_id)))?;
        Ok((key, transfer))
    }

    fn open_transfer(
        &self,
        key: &TransferKey,
        path: &NamespacePath,
        total: u32,
    ) -> Result<Arc<Transfer>> {
        let transfer = self
            .transfers
            .entry(key.clone())
            .or_insert_with(|| {
                self.facade.metrics().active_transfers.inc();
                let staging = self
                    .config
                    .staging_dir
                    .join(uuid::Uuid::new_v4().simple().to_string());
                Arc::new(Transfer::new(key.1.clone(), path.clone(), total, staging))
            })
            .value()
            .clone();
        transfer.check_matches(path, total)?;
        Ok(transfer)
    }

    /// Concatenate the slots in index order and publish them
    async fn finalize(
        &self,
        ctx: &IdentityContext,
        transfer: &Transfer,
        set: &ChunkSet,
    ) -> Result<FileInfo> {
        let slots: Vec<PathBuf> = (0..transfer.total).map(|i| transfer.slot_path(i)).collect();
        let chunks = futures::stream::iter(slots)
            .then(|slot| async move { fs::File::open(slot).await.map(ReaderStream::new) })
            .try_flatten();
        let assembled: ByteStream = Box::pin(StreamReader::new(chunks));

        debug!(transfer = %transfer.id, path = %transfer.path, "Finalizing transfer");
        self.facade
            .upload_file(
                ctx,
                transfer.path.as_str(),
                assembled,
                set.client_checksum.as_ref(),
            )
            .await
    }

    /// Move a live transfer into a terminal state and release its staging
    async fn release(
        &self,
        key: &TransferKey,
        transfer: &Arc<Transfer>,
        set: &mut ChunkSet,
        state: TransferState,
    ) {
        set.state = state;
        self.transfers
            .remove_if(key, |_, t| Arc::ptr_eq(t, transfer));
        if let Err(e) = fs::remove_dir_all(&transfer.staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(transfer = %transfer.id, "Failed to release staging: {}", e);
            }
        }

        let metrics = self.facade.metrics();
        metrics.active_transfers.dec();
        let label = match state {
            TransferState::Done => outcome::COMPLETED,
            TransferState::Expired => outcome::EXPIRED,
            _ => outcome::ABORTED,
        };
        metrics.transfers.with_label_values(&[label]).inc();
    }
}

/// Empty `dir` (creating it if needed), returning how many entries were removed
async fn purge_dir(dir: &Path) -> Result<usize> {
    fs::create_dir_all(dir).await?;
    let mut purged = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        purged += 1;
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{compute_bytes, ChecksumAlgorithm};
    use crate::domain::ports::User;
    use crate::error::ErrorCode;
    use crate::metrics::GatewayMetrics;
    use crate::storage::{BackendRoute, MemoryDriver, RouteMatcher};
    use assert_matches::assert_matches;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Harness {
        assembler: Arc<ChunkAssembler>,
        facade: Arc<StorageFacade>,
        _staging: TempDir,
    }

    async fn harness_with(window: Duration) -> Harness {
        let staging = TempDir::new().unwrap();
        let facade = Arc::new(
            StorageFacade::new(GatewayMetrics::new().unwrap()).with_route(BackendRoute::new(
                RouteMatcher::Any,
                Arc::new(MemoryDriver::new()),
            )),
        );
        let config = ChunkConfig {
            staging_dir: staging.path().to_path_buf(),
            inactivity_window: window,
            max_chunk_size: 1024,
            max_chunks: 16,
            ..Default::default()
        };
        let assembler = Arc::new(ChunkAssembler::new(config, facade.clone()).await.unwrap());
        Harness {
            assembler,
            facade,
            _staging: staging,
        }
    }

    async fn harness() -> Harness {
        harness_with(Duration::from_secs(3600)).await
    }

    async fn alice(h: &Harness) -> IdentityContext {
        let ctx = IdentityContext::for_user(User::new("alice"));
        h.facade.bootstrap_home(&ctx).await.unwrap();
        ctx
    }

    fn stream(data: &[u8]) -> ByteStream {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    async fn send(
        h: &Harness,
        ctx: &IdentityContext,
        id: &str,
        index: u32,
        total: u32,
        data: &[u8],
    ) -> Result<ChunkOutcome> {
        h.assembler
            .deliver(ctx, "/big.bin", ChunkDescriptor::new(id, index, total), stream(data), None)
            .await
    }

    async fn contents(h: &Harness, ctx: &IdentityContext, path: &str) -> Vec<u8> {
        let mut download = h.facade.download_file(ctx, path).await.unwrap();
        let mut out = Vec::new();
        download.stream.read_to_end(&mut out).await.unwrap();
        out
    }

    fn staged_transfers(h: &Harness) -> usize {
        std::fs::read_dir(h._staging.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name() != INCOMING_DIR)
            .count()
    }

    #[tokio::test]
    async fn test_out_of_order_delivery() {
        let h = harness().await;
        let ctx = alice(&h).await;

        assert_eq!(
            send(&h, &ctx, "t1", 2, 3, b"CC").await.unwrap(),
            ChunkOutcome::Pending { received: 1, total: 3 }
        );
        assert_eq!(
            send(&h, &ctx, "t1", 0, 3, b"AA").await.unwrap(),
            ChunkOutcome::Pending { received: 2, total: 3 }
        );
        let done = send(&h, &ctx, "t1", 1, 3, b"BB").await.unwrap();
        assert_matches!(done, ChunkOutcome::Completed(info) if info.size == 6);

        assert_eq!(contents(&h, &ctx, "/big.bin").await, b"AABBCC");
        assert_eq!(h.assembler.active_transfers(), 0);
        assert_eq!(staged_transfers(&h), 0);
    }

    #[tokio::test]
    async fn test_incomplete_set_is_invisible() {
        let h = harness().await;
        let ctx = alice(&h).await;
        send(&h, &ctx, "t1", 0, 3, b"AA").await.unwrap();
        send(&h, &ctx, "t1", 1, 3, b"BB").await.unwrap();

        let err = h.facade.examine(&ctx, "/big.bin").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let status = h.assembler.status(&ctx, "t1").await.unwrap();
        assert_eq!(status.received, vec![0, 1]);
        assert_eq!(status.state, TransferState::Assembling);
    }

    #[tokio::test]
    async fn test_redelivery_replaces_slot() {
        let h = harness().await;
        let ctx = alice(&h).await;
        send(&h, &ctx, "t1", 0, 3, b"AA").await.unwrap();
        send(&h, &ctx, "t1", 1, 3, b"first").await.unwrap();
        assert_eq!(
            send(&h, &ctx, "t1", 1, 3, b"BB").await.unwrap(),
            ChunkOutcome::Pending { received: 2, total: 3 }
        );
        send(&h, &ctx, "t1", 2, 3, b"CC").await.unwrap();
        assert_eq!(contents(&h, &ctx, "/big.bin").await, b"AABBCC");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_aborts_set() {
        let h = harness().await;
        let ctx = alice(&h).await;
        h.facade
            .upload_file(&ctx, "/big.bin", stream(b"previous"), None)
            .await
            .unwrap();

        let wrong = compute_bytes(ChecksumAlgorithm::Sha256, b"not the payload");
        send(&h, &ctx, "t1", 0, 2, b"AA").await.unwrap();
        let err = h
            .assembler
            .deliver(
                &ctx,
                "/big.bin",
                ChunkDescriptor::new("t1", 1, 2),
                stream(b"BB"),
                Some(&wrong),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadChecksum);

        assert_eq!(contents(&h, &ctx, "/big.bin").await, b"previous");
        assert_eq!(
            h.assembler.status(&ctx, "t1").await.unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(staged_transfers(&h), 0);

        // The id starts over from an empty set
        assert_eq!(
            send(&h, &ctx, "t1", 1, 2, b"BB").await.unwrap(),
            ChunkOutcome::Pending { received: 1, total: 2 }
        );
    }

    #[tokio::test]
    async fn test_matching_checksum_publishes() {
        let h = harness().await;
        let ctx = alice(&h).await;
        let sum = compute_bytes(ChecksumAlgorithm::Sha512, b"AABB");
        h.assembler
            .deliver(&ctx, "/big.bin", ChunkDescriptor::new("t", 0, 2), stream(b"AA"), Some(&sum))
            .await
            .unwrap();
        let done = send(&h, &ctx, "t", 1, 2, b"BB").await.unwrap();
        assert_matches!(done, ChunkOutcome::Completed(info) if info.checksum == Some(sum));
    }

    #[tokio::test]
    async fn test_expired_set_starts_fresh() {
        let h = harness_with(Duration::from_millis(20)).await;
        let ctx = alice(&h).await;
        send(&h, &ctx, "t1", 0, 2, b"AA").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.assembler.sweep().await, 1);
        assert_eq!(staged_transfers(&h), 0);

        assert_eq!(
            send(&h, &ctx, "t1", 1, 2, b"BB").await.unwrap(),
            ChunkOutcome::Pending { received: 1, total: 2 }
        );
        assert_eq!(
            h.facade.metrics().transfers.with_label_values(&[outcome::EXPIRED]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_transfer() {
        let h = harness_with(Duration::ZERO).await;
        let ctx = alice(&h).await;
        send(&h, &ctx, "t1", 0, 2, b"AA").await.unwrap();

        let transfer = h
            .assembler
            .transfers
            .iter()
            .next()
            .map(|e| e.value().clone())
            .unwrap();
        let guard = transfer.set.lock().await;
        assert_eq!(h.assembler.sweep().await, 0);
        drop(guard);
        assert_eq!(h.assembler.sweep().await, 1);
    }

    #[tokio::test]
    async fn test_slow_chunk_outlives_inactivity_window() {
        let h = harness_with(Duration::from_millis(40)).await;
        let ctx = alice(&h).await;
        send(&h, &ctx, "t1", 0, 2, b"AA").await.unwrap();

        let (mut writer, reader) = tokio::io::duplex(64);
        let slow = {
            let assembler = h.assembler.clone();
            tokio::spawn(async move {
                let ctx = IdentityContext::for_user(User::new("alice"));
                assembler
                    .deliver(&ctx, "/big.bin", ChunkDescriptor::new("t1", 1, 2), Box::pin(reader), None)
                    .await
            })
        };

        writer.write_all(b"B").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.assembler.sweep().await, 0);
        writer.write_all(b"B").await.unwrap();
        drop(writer);

        let done = slow.await.unwrap().unwrap();
        assert_matches!(done, ChunkOutcome::Completed(info) if info.size == 4);
        assert_eq!(contents(&h, &ctx, "/big.bin").await, b"AABB");
    }

    #[tokio::test]
    async fn test_descriptor_conflicts() {
        let h = harness().await;
        let ctx = alice(&h).await;
        send(&h, &ctx, "t1", 0, 3, b"AA").await.unwrap();

        let err = send(&h, &ctx, "t1", 1, 4, b"BB").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadInputData);
        let err = h
            .assembler
            .deliver(&ctx, "/other", ChunkDescriptor::new("t1", 1, 3), stream(b"B"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadInputData);
        let err = send(&h, &ctx, "t1", 0, 1, b"A").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadInputData);
    }

    #[tokio::test]
    async fn test_transfer_ids_are_per_user() {
        let h = harness().await;
        let alice_ctx = alice(&h).await;
        let bob_ctx = IdentityContext::for_user(User::new("bob"));
        h.facade.bootstrap_home(&bob_ctx).await.unwrap();

        send(&h, &alice_ctx, "shared", 0, 2, b"a0").await.unwrap();
        send(&h, &bob_ctx, "shared", 1, 2, b"b1").await.unwrap();
        send(&h, &bob_ctx, "shared", 0, 2, b"b0").await.unwrap();

        assert_eq!(contents(&h, &bob_ctx, "/big.bin").await, b"b0b1");
        assert_eq!(
            h.assembler.status(&alice_ctx, "shared").await.unwrap().received,
            vec![0]
        );
    }

    #[tokio::test]
    async fn test_abort_releases_staging() {
        let h = harness().await;
        let ctx = alice(&h).await;
        send(&h, &ctx, "t1", 0, 2, b"AA").await.unwrap();
        assert_eq!(staged_transfers(&h), 1);

        h.assembler.abort(&ctx, "t1").await.unwrap();
        assert_eq!(staged_transfers(&h), 0);
        assert_eq!(
            h.assembler.abort(&ctx, "t1").await.unwrap_err().code(),
            ErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_rejected() {
        let h = harness().await;
        let ctx = alice(&h).await;
        let err = send(&h, &ctx, "t1", 0, 2, &[0u8; 2048]).await.unwrap_err();
        assert_matches!(err, Error::TooBig { limit: 1024 });
        let incoming = std::fs::read_dir(h._staging.path().join(INCOMING_DIR)).unwrap();
        assert_eq!(incoming.count(), 0);
    }

    #[tokio::test]
    async fn test_parallel_deliveries_complete_once() {
        let h = harness().await;
        let ctx = alice(&h).await;
        drop(ctx);

        let total = 8u32;
        let mut tasks = Vec::new();
        for index in 0..total {
            let assembler = h.assembler.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = IdentityContext::for_user(User::new("alice"));
                let data = vec![b'a' + index as u8; 4];
                assembler
                    .deliver(
                        &ctx,
                        "/big.bin",
                        ChunkDescriptor::new("par", index, total),
                        Box::pin(std::io::Cursor::new(data)),
                        None,
                    )
                    .await
            }));
        }

        let mut completed = 0;
        for task in tasks {
            if let ChunkOutcome::Completed(_) = task.await.unwrap().unwrap() {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);

        let ctx = IdentityContext::for_user(User::new("alice"));
        assert_eq!(
            contents(&h, &ctx, "/big.bin").await,
            b"aaaabbbbccccddddeeeeffffgggghhhh"
        );
    }

    #[tokio::test]
    async fn test_startup_purges_staging() {
        let staging = TempDir::new().unwrap();
        std::fs::create_dir_all(staging.path().join("stale-transfer")).unwrap();
        std::fs::write(staging.path().join("stale-transfer/slot-000000"), b"x").unwrap();

        let facade = Arc::new(StorageFacade::new(GatewayMetrics::new().unwrap()));
        let config = ChunkConfig {
            staging_dir: staging.path().to_path_buf(),
            ..Default::default()
        };
        ChunkAssembler::new(config, facade).await.unwrap();
        assert!(!staging.path().join("stale-transfer").exists());
        assert!(staging.path().join(INCOMING_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let h = harness().await;
        let (tx, rx) = broadcast::channel(1);
        let handle = h.assembler.clone().spawn_sweeper(rx);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
