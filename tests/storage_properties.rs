//! Behavioural properties of the storage core, exercised through the public
//! facade and chunk assembler against every backend kind.

use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use sync_gateway::checksum::compute_bytes;
use sync_gateway::{
    BackendRoute, ByteStream, Checksum, ChecksumAlgorithm, ChunkAssembler, ChunkConfig,
    ChunkDescriptor, ChunkOutcome, ErrorCode, GatewayMetrics, IdentityContext, LocalDriver,
    MemoryDriver, RouteMatcher, StorageFacade, User,
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Local,
    Memory,
}

const KINDS: [Kind; 2] = [Kind::Local, Kind::Memory];

struct Harness {
    facade: Arc<StorageFacade>,
    assembler: Arc<ChunkAssembler>,
    ctx: IdentityContext,
    _dir: TempDir,
}

async fn harness_with(kind: Kind, window: Duration) -> Harness {
    let dir = TempDir::new().unwrap();
    let route = match kind {
        Kind::Local => BackendRoute::new(
            RouteMatcher::Any,
            Arc::new(LocalDriver::with_path(dir.path().join("root")).await.unwrap()),
        ),
        Kind::Memory => BackendRoute::new(RouteMatcher::Any, Arc::new(MemoryDriver::new())),
    };
    let facade = Arc::new(StorageFacade::new(GatewayMetrics::new().unwrap()).with_route(route));
    let config = ChunkConfig {
        staging_dir: dir.path().join("staging"),
        inactivity_window: window,
        ..ChunkConfig::default()
    };
    let assembler = Arc::new(ChunkAssembler::new(config, facade.clone()).await.unwrap());

    let ctx = IdentityContext::for_user(User::new("alice"));
    facade.bootstrap_home(&ctx).await.unwrap();

    Harness {
        facade,
        assembler,
        ctx,
        _dir: dir,
    }
}

async fn harness(kind: Kind) -> Harness {
    harness_with(kind, Duration::from_secs(3600)).await
}

fn stream(data: &[u8]) -> ByteStream {
    Box::pin(std::io::Cursor::new(data.to_vec()))
}

fn sha256(data: &[u8]) -> Checksum {
    compute_bytes(ChecksumAlgorithm::Sha256, data)
}

async fn read_all(h: &Harness, path: &str) -> Vec<u8> {
    let mut download = h.facade.download_file(&h.ctx, path).await.unwrap();
    let mut out = Vec::new();
    download.stream.read_to_end(&mut out).await.unwrap();
    out
}

async fn chunk(
    h: &Harness,
    path: &str,
    id: &str,
    index: u32,
    total: u32,
    data: &[u8],
    checksum: Option<&Checksum>,
) -> sync_gateway::Result<ChunkOutcome> {
    h.assembler
        .deliver(
            &h.ctx,
            path,
            ChunkDescriptor::new(id, index, total),
            stream(data),
            checksum,
        )
        .await
}

#[tokio::test]
async fn test_round_trip_preserves_bytes_and_checksum() {
    for kind in KINDS {
        let h = harness(kind).await;
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let sum = sha256(&data);

        let info = h
            .facade
            .upload_file(&h.ctx, "/blob.bin", stream(&data), Some(&sum))
            .await
            .unwrap();
        assert_eq!(info.size, data.len() as u64, "{:?}", kind);

        assert_eq!(read_all(&h, "/blob.bin").await, data, "{:?}", kind);
        assert_eq!(h.facade.examine(&h.ctx, "/blob.bin").await.unwrap().checksum, Some(sum));
    }
}

#[tokio::test]
async fn test_readers_never_observe_partial_content() {
    for kind in KINDS {
        let h = Arc::new(harness(kind).await);
        let old = vec![b'a'; 256 * 1024];
        let new = vec![b'b'; 512 * 1024];
        h.facade
            .upload_file(&h.ctx, "/doc", stream(&old), None)
            .await
            .unwrap();

        for _ in 0..8 {
            let writer = {
                let h = h.clone();
                let new = new.clone();
                tokio::spawn(async move {
                    h.facade
                        .upload_file(&h.ctx, "/doc", stream(&new), None)
                        .await
                        .unwrap();
                })
            };
            let seen = read_all(&h, "/doc").await;
            assert!(seen == old || seen == new, "{:?}: mixed read of {} bytes", kind, seen.len());
            writer.await.unwrap();
        }
        assert_eq!(read_all(&h, "/doc").await, new);
    }
}

#[tokio::test]
async fn test_chunk_arrival_order_does_not_matter() {
    let parts: [&[u8]; 3] = [b"first-", b"second-", b"third"];
    let orders = [[0, 1, 2], [2, 0, 1], [1, 2, 0], [2, 1, 0]];

    for kind in KINDS {
        let h = harness(kind).await;
        for (n, order) in orders.iter().enumerate() {
            let path = format!("/ordered-{}", n);
            let id = format!("t-{}", n);
            let mut outcomes = Vec::new();
            for &index in order {
                outcomes.push(chunk(&h, &path, &id, index, 3, parts[index as usize], None).await.unwrap());
            }
            assert_matches!(outcomes[0], ChunkOutcome::Pending { received: 1, total: 3 });
            assert_matches!(outcomes[2], ChunkOutcome::Completed(_));
            assert_eq!(read_all(&h, &path).await, b"first-second-third", "{:?}", kind);
        }
    }
}

#[tokio::test]
async fn test_incomplete_sets_are_invisible() {
    for kind in KINDS {
        let h = harness(kind).await;
        chunk(&h, "/fresh", "t-1", 0, 3, b"a", None).await.unwrap();
        chunk(&h, "/fresh", "t-1", 1, 3, b"b", None).await.unwrap();
        let err = h.facade.examine(&h.ctx, "/fresh").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound, "{:?}", kind);

        h.facade
            .upload_file(&h.ctx, "/existing", stream(b"prior"), None)
            .await
            .unwrap();
        chunk(&h, "/existing", "t-2", 0, 3, b"x", None).await.unwrap();
        chunk(&h, "/existing", "t-2", 2, 3, b"z", None).await.unwrap();
        assert_eq!(read_all(&h, "/existing").await, b"prior");
        assert_eq!(h.facade.examine(&h.ctx, "/existing").await.unwrap().size, 5);
    }
}

#[tokio::test]
async fn test_checksum_mismatch_leaves_destination_untouched() {
    for kind in KINDS {
        let h = harness(kind).await;
        h.facade
            .upload_file(&h.ctx, "/keep", stream(b"original"), None)
            .await
            .unwrap();
        let before = h.facade.examine(&h.ctx, "/keep").await.unwrap();

        let wrong = sha256(b"something else");
        let err = h
            .facade
            .upload_file(&h.ctx, "/keep", stream(b"replacement"), Some(&wrong))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadChecksum, "{:?}", kind);

        chunk(&h, "/keep", "t-1", 0, 2, b"re", Some(&wrong)).await.unwrap();
        let err = chunk(&h, "/keep", "t-1", 1, 2, b"placement", None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadChecksum);

        assert_eq!(read_all(&h, "/keep").await, b"original");
        assert_eq!(h.facade.examine(&h.ctx, "/keep").await.unwrap().checksum, before.checksum);
        assert_eq!(h.assembler.active_transfers(), 0);
    }
}

#[tokio::test]
async fn test_redelivered_chunk_replaces_its_slot() {
    for kind in KINDS {
        let h = harness(kind).await;
        chunk(&h, "/re", "t-1", 0, 3, b"AA", None).await.unwrap();
        chunk(&h, "/re", "t-1", 1, 3, b"stale", None).await.unwrap();
        let outcome = chunk(&h, "/re", "t-1", 1, 3, b"BB", None).await.unwrap();
        assert_eq!(outcome, ChunkOutcome::Pending { received: 2, total: 3 }, "{:?}", kind);

        let expected = sha256(b"AABBCC");
        let outcome = chunk(&h, "/re", "t-1", 2, 3, b"CC", Some(&expected)).await.unwrap();
        assert_matches!(outcome, ChunkOutcome::Completed(info) if info.size == 6);
        assert_eq!(read_all(&h, "/re").await, b"AABBCC");
    }
}

#[tokio::test]
async fn test_expired_transfer_restarts_fresh() {
    for kind in KINDS {
        let h = harness_with(kind, Duration::from_millis(50)).await;
        chunk(&h, "/late", "t-1", 0, 2, b"old-", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(h.assembler.sweep().await, 1, "{:?}", kind);

        let outcome = chunk(&h, "/late", "t-1", 1, 2, b"tail", None).await.unwrap();
        assert_eq!(outcome, ChunkOutcome::Pending { received: 1, total: 2 });
        chunk(&h, "/late", "t-1", 0, 2, b"new-", None).await.unwrap();
        assert_eq!(read_all(&h, "/late").await, b"new-tail");
    }
}

#[tokio::test]
async fn test_listing_returns_direct_children_in_order() {
    for kind in KINDS {
        let h = harness(kind).await;
        h.facade.create_folder(&h.ctx, "/p").await.unwrap();
        h.facade.create_folder(&h.ctx, "/p/sub").await.unwrap();
        h.facade.create_folder(&h.ctx, "/p-other").await.unwrap();
        for path in ["/p/c", "/p/a", "/p/sub/deep", "/p-other/x", "/p/b"] {
            h.facade.upload_file(&h.ctx, path, stream(b"."), None).await.unwrap();
        }

        let listed: Vec<String> = h
            .facade
            .list_folder(&h.ctx, "/p")
            .await
            .unwrap()
            .into_iter()
            .map(|info| info.path.as_str().to_string())
            .collect();
        assert_eq!(listed, vec!["/p/a", "/p/b", "/p/c", "/p/sub"], "{:?}", kind);
    }
}
