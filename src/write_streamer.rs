//! C5: Write Streamer.
//!
//! Append-only write path: slices an incoming byte stream into
//! fixed-size chunks, uploads each with bounded retry against a
//! rate-limited remote, and finalises the catalog on flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::{Catalog, ChunkRecord, FileRecord};
use crate::chunk::Chunk;
use crate::chunked_file::ChunkedFile;
use crate::error::{FragfsError, Result};
use crate::remote::BlobStore;

const MAX_UPLOAD_ATTEMPTS: u32 = 3;
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(2);

struct CurrentChunk {
    idx: u32,
    buffer: BytesMut,
}

/// Append-only stream into a new `ChunkedFile` with a fresh file-id.
pub struct WriteStreamer {
    pub file_id: String,
    pub filename: String,
    chunk_size: u64,
    store: Arc<dyn BlobStore>,
    sealed: Mutex<Vec<Arc<Chunk>>>,
    current: Mutex<CurrentChunk>,
    total_written: AtomicU64,
}

impl WriteStreamer {
    pub fn new(filename: String, chunk_size: u64, store: Arc<dyn BlobStore>) -> Self {
        WriteStreamer {
            file_id: Uuid::new_v4().to_string(),
            filename,
            chunk_size,
            store,
            sealed: Mutex::new(Vec::new()),
            current: Mutex::new(CurrentChunk {
                idx: 0,
                buffer: BytesMut::new(),
            }),
            total_written: AtomicU64::new(0),
        }
    }

    /// Append `data`, splitting across chunk boundaries as needed. The
    /// kernel-supplied offset is used only for accounting -- out of
    /// order writes are unsupported and give no guarantee.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut remaining = data;

        while !remaining.is_empty() {
            let mut current = self.current.lock().await;
            let space = (self.chunk_size as usize).saturating_sub(current.buffer.len());
            let take = space.min(remaining.len());

            current.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            let full = current.buffer.len() as u64 >= self.chunk_size;
            if full {
                let idx = current.idx;
                let sealed_bytes = current.buffer.split().freeze();
                current.idx += 1;
                drop(current);

                self.upload_with_retry(idx, sealed_bytes).await?;
            }
        }

        self.total_written.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn upload_with_retry(&self, idx: u32, bytes: Bytes) -> Result<()> {
        let name = Uuid::new_v4().to_string();
        let start = self.chunk_start(idx);

        let chunk = Arc::new(Chunk::new_in_memory(idx, name, start, bytes));

        let mut attempts = 0;
        loop {
            match chunk.send(self.store.as_ref()).await {
                Ok(()) => {
                    self.sealed.lock().await.push(chunk);
                    return Ok(());
                }
                Err(FragfsError::RateLimited(retry_after)) => {
                    warn!("chunk {} rate-limited, sleeping {:?}", idx, retry_after);
                    tokio::time::sleep(retry_after).await;
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= MAX_UPLOAD_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(
                        "chunk {} upload attempt {} failed ({}), retrying in {:?}",
                        idx, attempts, err, TRANSIENT_RETRY_DELAY
                    );
                    tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn chunk_start(&self, idx: u32) -> u64 {
        idx as u64 * self.chunk_size
    }

    pub fn bytes_written(&self) -> u64 {
        self.total_written.load(Ordering::SeqCst)
    }

    /// Seal the current (possibly partial) chunk, upload it, and
    /// persist the whole file to the catalog. Chunks already uploaded
    /// before a persist failure become orphaned blobs on the remote;
    /// this core does not garbage-collect them.
    pub async fn flush(&self, catalog: &dyn Catalog, tmp_dir: &std::path::Path) -> Result<Arc<ChunkedFile>> {
        let tail = {
            let mut current = self.current.lock().await;
            if current.buffer.is_empty() {
                None
            } else {
                let idx = current.idx;
                Some((idx, current.buffer.split().freeze()))
            }
        };

        if let Some((idx, bytes)) = tail {
            self.upload_with_retry(idx, bytes).await?;
        }

        let chunks = self.sealed.lock().await.clone();
        let total_size = self.total_written.load(Ordering::SeqCst);

        catalog
            .persist_file(
                &self.file_id,
                &FileRecord {
                    filename: self.filename.clone(),
                    size: total_size,
                    num_chunks: chunks.len() as u32,
                },
            )
            .await?;

        for chunk in &chunks {
            let handle = chunk.handle().await.ok_or(FragfsError::MissingRemoteHandle)?;
            catalog
                .persist_chunk(
                    &self.file_id,
                    chunk.idx,
                    &ChunkRecord {
                        size: chunk.size,
                        name: chunk.name.clone(),
                        handle,
                    },
                )
                .await?;
        }

        info!("flushed `{}` ({} bytes, {} chunks)", self.filename, total_size, chunks.len());

        Ok(Arc::new(ChunkedFile::from_ingest(
            self.file_id.clone(),
            self.filename.clone(),
            total_size,
            chunks,
            tmp_dir.to_path_buf(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemCatalog;
    use crate::remote::fake::FakeBlobStore;

    fn tmp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("fragfs-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn round_trip_small_write() {
        let store: Arc<FakeBlobStore> = Arc::new(FakeBlobStore::new());
        let catalog = MemCatalog::new();
        let streamer = WriteStreamer::new("hello.txt".into(), 20_000_000, store.clone());

        streamer.write(b"hello world").await.unwrap();
        let file = streamer.flush(&catalog, &tmp_dir()).await.unwrap();

        assert_eq!(file.original_size, 11);
        assert_eq!(file.chunks.len(), 1);

        let got = file.read_range(0, 11, store.clone()).await;
        assert_eq!(&got[..], b"hello world");
    }

    #[tokio::test]
    async fn write_spanning_exact_chunk_boundary_makes_two_chunks() {
        let store: Arc<FakeBlobStore> = Arc::new(FakeBlobStore::new());
        let catalog = MemCatalog::new();
        let streamer = WriteStreamer::new("f.bin".into(), 10, store.clone());

        streamer.write(&[1u8; 15]).await.unwrap();
        let file = streamer.flush(&catalog, &tmp_dir()).await.unwrap();

        assert_eq!(file.chunks.len(), 2);
        assert_eq!(file.chunks[0].size, 10);
        assert_eq!(file.chunks[1].size, 5);
    }

    #[tokio::test]
    async fn catalog_has_consistent_keys_after_flush() {
        let store: Arc<FakeBlobStore> = Arc::new(FakeBlobStore::new());
        let catalog = MemCatalog::new();
        let streamer = WriteStreamer::new("f.bin".into(), 10, store.clone());
        streamer.write(&[7u8; 25]).await.unwrap();
        let file = streamer.flush(&catalog, &tmp_dir()).await.unwrap();

        let record = catalog.restore_file(&file.id).await.unwrap();
        assert_eq!(record.num_chunks as usize, file.chunks.len());

        let mut total = 0u64;
        for idx in 0..record.num_chunks {
            let chunk_record = catalog.restore_chunk(&file.id, idx).await.unwrap();
            assert!(!chunk_record.handle.is_empty());
            total += chunk_record.size;
        }
        assert_eq!(total, record.size);
    }

    /// Property 8: `RateLimited(T)` twice then success delays exactly
    /// `2T` (±slack) before the chunk is persisted. `script_next_uploads`
    /// scripts by call order rather than by chunk name, since the
    /// streamer assigns each chunk a fresh random uuid we can't predict.
    #[tokio::test]
    async fn rate_limit_twice_then_success_delays_by_exact_2t() {
        let store: Arc<FakeBlobStore> = Arc::new(FakeBlobStore::new());
        let retry_after = Duration::from_millis(40);
        store.script_next_uploads(vec![
            Err(FragfsError::RateLimited(retry_after)),
            Err(FragfsError::RateLimited(retry_after)),
            Ok(()),
        ]);

        let catalog = MemCatalog::new();
        let streamer = WriteStreamer::new("f.bin".into(), 10, store.clone());

        let start = std::time::Instant::now();
        streamer.write(&[9u8; 10]).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= retry_after * 2);
        assert!(elapsed < retry_after * 2 + Duration::from_millis(500));

        let file = streamer.flush(&catalog, &tmp_dir()).await.unwrap();
        assert_eq!(file.chunks.len(), 1);
        let record = catalog.restore_chunk(&file.id, 0).await.unwrap();
        assert!(!record.handle.is_empty());
    }
}
