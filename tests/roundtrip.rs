//! End-to-end scenarios against the in-memory fakes (`MemCatalog`,
//! `FakeBlobStore`), through the public `WriteStreamer`/`ChunkedFile`
//! API. No FUSE bridge involved -- that adapter is a thin, untested
//! shim over this same API per `spec.md` §1's scoping.
//!
//! Chunk sizes are scaled down from the real `CHUNK_SIZE` (20,000,000)
//! so the multi-chunk scenarios run in milliseconds rather than
//! shipping tens of megabytes through an in-memory fake.

use std::sync::Arc;
use std::time::Duration;

use fragfs::catalog::{Catalog, MemCatalog};
use fragfs::error::FragfsError;
use fragfs::remote::fake::FakeBlobStore;
use fragfs::remote::BlobStore;
use fragfs::write_streamer::WriteStreamer;

const CHUNK_SIZE: u64 = 1000;

async fn write_and_flush(
    filename: &str,
    data: &[u8],
    chunk_size: u64,
    store: Arc<FakeBlobStore>,
    catalog: &MemCatalog,
    tmp_dir: &std::path::Path,
) -> Arc<fragfs::chunked_file::ChunkedFile> {
    let streamer = WriteStreamer::new(filename.to_string(), chunk_size, store);
    streamer.write(data).await.unwrap();
    streamer.flush(catalog, tmp_dir).await.unwrap()
}

/// S1: tiny file.
#[tokio::test]
async fn tiny_file_round_trips() {
    let store = Arc::new(FakeBlobStore::new());
    let catalog = MemCatalog::new();
    let tmp_dir = tempfile::tempdir().unwrap();

    let file = write_and_flush("hello.txt", b"hello world", CHUNK_SIZE, store.clone(), &catalog, tmp_dir.path()).await;

    assert_eq!(file.original_size, 11);
    assert_eq!(file.chunks.len(), 1);

    let got = file.read_range(0, 11, store.clone()).await;
    assert_eq!(&got[..], b"hello world");
}

/// Property 1: round-trip at the boundary lengths `spec.md` §8 names
/// that the other scenarios don't already cover (`0`, `1`,
/// `CHUNK_SIZE-1`, `CHUNK_SIZE+1`; `CHUNK_SIZE` and `3*CHUNK_SIZE+17`
/// are covered by `exact_chunk_boundary_yields_one_chunk` and
/// `multi_chunk_write_preserves_byte_pattern` respectively).
#[tokio::test]
async fn round_trip_boundary_lengths() {
    let store = Arc::new(FakeBlobStore::new());
    let catalog = MemCatalog::new();
    let tmp_dir = tempfile::tempdir().unwrap();

    for &len in &[0u64, 1, CHUNK_SIZE - 1, CHUNK_SIZE + 1] {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let name = format!("boundary-{len}.bin");
        let file = write_and_flush(&name, &data, CHUNK_SIZE, store.clone(), &catalog, tmp_dir.path()).await;

        assert_eq!(file.original_size, len);
        let got = file.read_range(0, len, store.clone()).await;
        assert_eq!(&got[..], &data[..], "length {len}");
    }
}

/// S2: a write landing exactly on a chunk boundary yields one full chunk.
#[tokio::test]
async fn exact_chunk_boundary_yields_one_chunk() {
    let store = Arc::new(FakeBlobStore::new());
    let catalog = MemCatalog::new();
    let tmp_dir = tempfile::tempdir().unwrap();

    let data = vec![0u8; CHUNK_SIZE as usize];
    let file = write_and_flush("zeroes.bin", &data, CHUNK_SIZE, store.clone(), &catalog, tmp_dir.path()).await;

    assert_eq!(file.chunks.len(), 1);
    assert_eq!(file.original_size, CHUNK_SIZE);

    let last_byte = file.read_range(CHUNK_SIZE - 1, 1, store.clone()).await;
    assert_eq!(&last_byte[..], &[0u8]);
}

/// S3: multi-chunk write with a repeating byte pattern.
#[tokio::test]
async fn multi_chunk_write_preserves_byte_pattern() {
    let store = Arc::new(FakeBlobStore::new());
    let catalog = MemCatalog::new();
    let tmp_dir = tempfile::tempdir().unwrap();

    let total = CHUNK_SIZE * 2 + CHUNK_SIZE / 2;
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let file = write_and_flush("pattern.bin", &data, CHUNK_SIZE, store.clone(), &catalog, tmp_dir.path()).await;

    assert_eq!(file.chunks.len(), 3);
    assert_eq!(file.chunks[0].size, CHUNK_SIZE);
    assert_eq!(file.chunks[1].size, CHUNK_SIZE);
    assert_eq!(file.chunks[2].size, CHUNK_SIZE / 2);

    for &(a, b) in &[(0u64, 1u64), (CHUNK_SIZE, CHUNK_SIZE + 1), (total - 1, total)] {
        let got = file.read_range(a, b - a, store.clone()).await;
        assert_eq!(&got[..], &data[a as usize..b as usize]);
    }
}

/// Restart idempotence (property 5): drop all in-memory state and
/// restore from the catalog; reads after restore match reads before.
#[tokio::test]
async fn restore_after_restart_matches_original_reads() {
    let store: Arc<dyn BlobStore> = Arc::new(FakeBlobStore::new());
    let catalog = MemCatalog::new();
    let tmp_dir = tempfile::tempdir().unwrap();

    let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 199) as u8).collect();
    let streamer = WriteStreamer::new("restart.bin".into(), CHUNK_SIZE, store.clone());
    streamer.write(&data).await.unwrap();
    let original = streamer.flush(&catalog, tmp_dir.path()).await.unwrap();
    let before = original.read_range(0, data.len() as u64, store.clone()).await;

    let restored = fragfs::chunked_file::ChunkedFile::restore(&catalog, &original.id, tmp_dir.path().to_path_buf())
        .await
        .unwrap();
    let after = restored.read_range(0, data.len() as u64, store.clone()).await;

    assert_eq!(before, after);
    assert_eq!(&after[..], &data[..]);
}

/// S6: `C1.Upload` returns `RateLimited` on attempt 1, then succeeds;
/// the flushed file still commits and the catalog holds the handle
/// from the successful attempt. `script_next_uploads` scripts by call
/// order since the streamer assigns each chunk a fresh random uuid.
#[tokio::test]
async fn rate_limited_upload_retries_and_commits() {
    let store = Arc::new(FakeBlobStore::new());
    let catalog = MemCatalog::new();
    let tmp_dir = tempfile::tempdir().unwrap();
    let retry_after = Duration::from_millis(50);

    store.script_next_uploads(vec![Err(FragfsError::RateLimited(retry_after)), Ok(())]);

    let streamer = WriteStreamer::new("limited.bin".into(), CHUNK_SIZE, store.clone());
    streamer.write(b"short write").await.unwrap();

    // The partial chunk only uploads on flush (the tail path), which is
    // where the scripted rate limit bites.
    let start = std::time::Instant::now();
    let file = streamer.flush(&catalog, tmp_dir.path()).await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= retry_after);

    let record = catalog.restore_file(&file.id).await.unwrap();
    assert_eq!(record.num_chunks, 1);
    assert!(!catalog.restore_chunk(&file.id, 0).await.unwrap().handle.is_empty());
}
