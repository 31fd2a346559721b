//! C4: ChunkedFile.
//!
//! Aggregates the ordered chunks of one logical file, owns the
//! optional scratch file, implements range reads across chunk
//! boundaries, and coordinates the prefetch/download campaign.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::catalog::{Catalog, ChunkRecord, FileRecord};
use crate::chunk::{Chunk, ChunkState, SharedChunk};
use crate::error::Result;
use crate::remote::BlobStore;

struct ScratchFile {
    file: File,
    bytes_materialised: AtomicU64,
}

/// One logical file and its ordered chunks.
pub struct ChunkedFile {
    pub id: String,
    pub filename: String,
    pub original_size: u64,
    pub chunks: Vec<SharedChunk>,
    tmp_dir: PathBuf,
    scratch: Mutex<Option<ScratchFile>>,
    ready: AtomicBool,
    ready_notify: Notify,
    download_started: AtomicBool,
    last_read: Mutex<SystemTime>,
    currently_reading: AtomicBool,
}

impl ChunkedFile {
    fn new(id: String, filename: String, original_size: u64, chunks: Vec<SharedChunk>, tmp_dir: PathBuf) -> Self {
        ChunkedFile {
            id,
            filename,
            original_size,
            chunks,
            tmp_dir,
            scratch: Mutex::new(None),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
            download_started: AtomicBool::new(false),
            last_read: Mutex::new(SystemTime::now()),
            currently_reading: AtomicBool::new(false),
        }
    }

    /// Build a `ChunkedFile` from chunks already committed in memory
    /// at the end of a write ingest (C5), keeping the file-id the
    /// streamer already persisted to the catalog. Readiness is set
    /// immediately.
    pub fn from_ingest(id: String, filename: String, original_size: u64, chunks: Vec<SharedChunk>, tmp_dir: PathBuf) -> Self {
        let file = Self::new(id, filename, original_size, chunks, tmp_dir);
        file.enable();
        file
    }

    /// Build a not-yet-ready shell; caller populates `chunks` by
    /// restoring each one from the catalog, then calls `enable`.
    fn shell(id: String, filename: String, original_size: u64, tmp_dir: PathBuf) -> Self {
        Self::new(id, filename, original_size, Vec::new(), tmp_dir)
    }

    fn scratch_path(&self) -> PathBuf {
        self.tmp_dir.join(&self.id)
    }

    /// Restore a `ChunkedFile` from the catalog: read the `/cf/<id>/*`
    /// keys, then each chunk's `/ci/<id>/<k>/*` keys in parallel,
    /// seeding SCRATCH state for any chunk already covered by a
    /// pre-existing scratch file on disk (the materialisation
    /// threshold of §4.4: `bytes_materialised >= chunk.end`).
    pub async fn restore(catalog: &dyn Catalog, file_id: &str, tmp_dir: PathBuf) -> Result<Arc<Self>> {
        let FileRecord {
            filename,
            size,
            num_chunks,
        } = catalog.restore_file(file_id).await?;

        let scratch_path = tmp_dir.join(file_id);
        let bytes_materialised = std::fs::metadata(&scratch_path).map(|m| m.len()).unwrap_or(0);

        let restores = (0..num_chunks).map(|idx| async move { catalog.restore_chunk(file_id, idx).await });
        let records: Vec<Result<ChunkRecord>> = futures::future::join_all(restores).await;

        let mut chunks = Vec::with_capacity(num_chunks as usize);
        let mut offset = 0u64;
        for (idx, record) in records.into_iter().enumerate() {
            let ChunkRecord { size, name, handle } = record.unwrap_or_default();
            let chunk = Arc::new(Chunk::new_remote(idx as u32, size, name, offset, handle));
            if bytes_materialised >= chunk.end {
                chunk.mark_scratch().await;
            }
            offset += size;
            chunks.push(chunk);
        }

        let file = Arc::new(Self::new(file_id.to_string(), filename, size, chunks, tmp_dir));

        if bytes_materialised > 0 {
            if let Ok(opened) = OpenOptions::new().read(true).write(true).open(&scratch_path) {
                *file.scratch.lock().await = Some(ScratchFile {
                    file: opened,
                    bytes_materialised: AtomicU64::new(bytes_materialised),
                });
            }
        }

        file.enable();
        Ok(file)
    }

    /// Flip the readiness latch. Monotonic: once set, stays set.
    pub fn enable(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.ready_notify.notify_waiters();
    }

    /// Block until restoration has finished. Already-ready files
    /// return immediately.
    pub async fn wait_ready(&self) {
        while !self.ready.load(Ordering::SeqCst) {
            self.ready_notify.notified().await;
        }
    }

    async fn ensure_scratch(&self) -> std::io::Result<()> {
        let mut guard = self.scratch.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.tmp_dir)?;
        let path = self.scratch_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(self.original_size)?;

        *guard = Some(ScratchFile {
            file,
            bytes_materialised: AtomicU64::new(0),
        });
        Ok(())
    }

    /// Start a download campaign through `store`'s concurrency cap for
    /// every chunk that is still REMOTE. A no-op if a campaign is
    /// already active for this file.
    pub async fn start_download_campaign(self: &Arc<Self>, store: Arc<dyn BlobStore>) {
        if self.download_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.ensure_scratch().await.is_err() {
            warn!("failed to create scratch file for `{}`", self.filename);
        }

        for chunk in self.chunks.clone() {
            if !chunk.should_download().await {
                continue;
            }
            let store = store.clone();
            let this = self.clone();
            tokio::spawn(async move {
                let scratch_file = {
                    let guard = this.scratch.lock().await;
                    guard.as_ref().map(|s| s.file.try_clone())
                };
                let scratch_file = match scratch_file {
                    Some(Ok(f)) => Some(f),
                    _ => None,
                };
                if let Err(err) = chunk.download(store.as_ref(), scratch_file.as_ref()).await {
                    warn!("download of chunk {} of `{}` failed: {}", chunk.idx, this.filename, err);
                } else if scratch_file.is_some() && chunk.state().await == ChunkState::Scratch {
                    let guard = this.scratch.lock().await;
                    if let Some(scratch) = guard.as_ref() {
                        scratch
                            .bytes_materialised
                            .fetch_max(chunk.end, Ordering::SeqCst);
                    }
                }
            });
        }
    }

    /// The central range-read algorithm: concatenate bytes across
    /// every chunk intersecting `[off, off+len)`, clamped to
    /// `[0, original_size)`. A failure on one chunk only shortens the
    /// overall read (standard short-read semantics), it never fails
    /// the whole call.
    pub async fn read_range(self: &Arc<Self>, off: u64, len: u64, store: Arc<dyn BlobStore>) -> Bytes {
        self.wait_ready().await;

        *self.last_read.lock().await = SystemTime::now();
        self.currently_reading.store(true, Ordering::SeqCst);

        self.start_download_campaign(store).await;

        let off = off.min(self.original_size);
        let end = (off + len).min(self.original_size);

        let mut out = BytesMut::with_capacity((end - off) as usize);
        for chunk in &self.chunks {
            if chunk.end <= off || chunk.start >= end {
                continue;
            }

            let rel_start = off.saturating_sub(chunk.start).min(chunk.size);
            let rel_end = (end.saturating_sub(chunk.start)).min(chunk.size);

            if chunk.should_download().await {
                let scratch_file = {
                    let guard = self.scratch.lock().await;
                    guard.as_ref().and_then(|s| s.file.try_clone().ok())
                };
                let _ = chunk.download(store.as_ref(), scratch_file.as_ref()).await;
            }

            let scratch_file = {
                let guard = self.scratch.lock().await;
                guard.as_ref().and_then(|s| s.file.try_clone().ok())
            };
            out.extend_from_slice(&chunk.read_range(rel_start, rel_end, scratch_file.as_ref()).await);
        }

        self.currently_reading.store(false, Ordering::SeqCst);
        out.freeze()
    }

    pub async fn is_idle(&self, ram_ttl: Duration) -> bool {
        if self.currently_reading.load(Ordering::SeqCst) {
            return false;
        }
        let last_read = *self.last_read.lock().await;
        last_read.elapsed().map(|el| el > ram_ttl).unwrap_or(false)
    }

    pub async fn prune_ram(&self) {
        for chunk in &self.chunks {
            chunk.prune_from_ram().await;
        }
    }

    /// Scratch-file age, using atime with an mtime fallback (§4.8, §9):
    /// on a filesystem/platform that never populates `st_atime` (left
    /// as the epoch), the modification time is used instead, per the
    /// Open Question in `spec.md` §9 about `noatime` mounts degrading
    /// the effective `FILE_TTL` to an mtime-based age.
    pub fn scratch_age(&self) -> Option<Duration> {
        let path = self.scratch_path();
        let stat = nix::sys::stat::stat(&path).ok()?;

        let reference_secs = if stat.st_atime > 0 { stat.st_atime } else { stat.st_mtime };
        let reference_nsec = if stat.st_atime > 0 { stat.st_atime_nsec } else { stat.st_mtime_nsec };

        let reference = SystemTime::UNIX_EPOCH + Duration::new(reference_secs.max(0) as u64, reference_nsec as u32);
        reference.elapsed().ok()
    }

    pub fn scratch_exists(&self) -> bool {
        self.scratch_path().exists()
    }

    /// Delete the scratch file and atomically revert every covered
    /// chunk to REMOTE.
    pub async fn evict_scratch(&self) {
        let mut guard = self.scratch.lock().await;
        *guard = None;
        let _ = std::fs::remove_file(self.scratch_path());
        drop(guard);

        for chunk in &self.chunks {
            chunk.force_remote().await;
        }
    }

    pub fn path_hint(&self) -> &Path {
        self.tmp_dir.as_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeBlobStore;
    use std::sync::Arc;

    fn tmp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("fragfs-test-{}", Uuid::new_v4()))
    }

    async fn ingest(store: &Arc<FakeBlobStore>, data: &[u8], chunk_size: u64) -> Arc<ChunkedFile> {
        let mut chunks = Vec::new();
        let mut start = 0u64;
        for (idx, piece) in data.chunks(chunk_size as usize).enumerate() {
            let bytes = Bytes::copy_from_slice(piece);
            let chunk = Arc::new(Chunk::new_in_memory(idx as u32, Uuid::new_v4().to_string(), start, bytes));
            chunk.send(store.as_ref()).await.unwrap();
            start += piece.len() as u64;
            chunks.push(chunk);
        }
        Arc::new(ChunkedFile::from_ingest(
            Uuid::new_v4().to_string(),
            "f.bin".into(),
            data.len() as u64,
            chunks,
            tmp_dir(),
        ))
    }

    #[tokio::test]
    async fn range_read_matches_original_bytes_across_chunks() {
        let store: Arc<FakeBlobStore> = Arc::new(FakeBlobStore::new());
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let file = ingest(&store, &data, 2000).await;

        for &(a, b) in &[(0u64, 1u64), (1999, 2001), (3999, 4001), (0, 5000)] {
            let got = file.read_range(a, b - a, store.clone()).await;
            assert_eq!(&got[..], &data[a as usize..b as usize]);
        }
    }

    #[tokio::test]
    async fn short_read_clamps_to_original_size() {
        let store: Arc<FakeBlobStore> = Arc::new(FakeBlobStore::new());
        let data = b"hello world";
        let file = ingest(&store, data, 20).await;

        let got = file.read_range(6, 100, store.clone()).await;
        assert_eq!(&got[..], b"world");
    }

    #[tokio::test]
    async fn readiness_latch_blocks_until_enabled() {
        let file = Arc::new(ChunkedFile::shell("id".into(), "f".into(), 0, tmp_dir()));
        let waiter = file.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_ready().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        file.enable();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
