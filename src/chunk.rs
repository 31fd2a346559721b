//! C3: Chunk state machine and I/O primitive.
//!
//! ```text
//!   REMOTE ──download──▶ MEMORY ──materialise──▶ SCRATCH
//!      ▲                    │                        │
//!      │                    ▼                        │
//!      └─────────evict──────┴───────evict────────────┘
//! ```
//!
//! Transitions are gated by the per-chunk lock; it is held for the
//! whole duration of a download, which is what causes concurrent
//! readers to wait until the chunk becomes serviceable.

use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{error, trace, warn};
use tokio::sync::Mutex;

use crate::error::{FragfsError, Result};
use crate::remote::{BlobStore, Handle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Remote,
    Memory,
    Scratch,
}

struct Inner {
    state: ChunkState,
    buffer: Option<Bytes>,
    handle: Option<Handle>,
}

/// A single fragment of a `ChunkedFile`.
pub struct Chunk {
    pub idx: u32,
    pub size: u64,
    pub name: String,
    pub start: u64,
    pub end: u64,
    inner: Mutex<Inner>,
    downloading: AtomicBool,
}

impl Chunk {
    /// Construct a freshly-written chunk, holding its bytes in memory.
    pub fn new_in_memory(idx: u32, name: String, start: u64, bytes: Bytes) -> Self {
        let size = bytes.len() as u64;
        Chunk {
            idx,
            size,
            name,
            start,
            end: start + size,
            inner: Mutex::new(Inner {
                state: ChunkState::Memory,
                buffer: Some(bytes),
                handle: None,
            }),
            downloading: AtomicBool::new(false),
        }
    }

    /// Construct a chunk shell from a catalog restore: remote-only
    /// until proven otherwise by the scratch-file inspection in
    /// `ChunkedFile::restore`.
    pub fn new_remote(idx: u32, size: u64, name: String, start: u64, handle: Handle) -> Self {
        Chunk {
            idx,
            size,
            name,
            start,
            end: start + size,
            inner: Mutex::new(Inner {
                state: ChunkState::Remote,
                buffer: None,
                handle: Some(handle),
            }),
            downloading: AtomicBool::new(false),
        }
    }

    /// Mark a restored chunk as already materialised on the parent's
    /// scratch file (invariant (g): the scratch file holds valid bytes
    /// over `[start, end)`).
    pub async fn mark_scratch(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = ChunkState::Scratch;
        inner.buffer = None;
    }

    pub async fn state(&self) -> ChunkState {
        self.inner.lock().await.state
    }

    pub async fn handle(&self) -> Option<Handle> {
        self.inner.lock().await.handle.clone()
    }

    /// True iff this chunk is `REMOTE` and no download is currently in flight.
    pub async fn should_download(&self) -> bool {
        !self.downloading.load(Ordering::SeqCst) && self.is_remote().await
    }

    async fn is_remote(&self) -> bool {
        self.inner.lock().await.state == ChunkState::Remote
    }

    /// Download this chunk's bytes through `store`, transitioning
    /// REMOTE -> MEMORY, then materialising into `scratch` if present
    /// (MEMORY -> SCRATCH). The chunk lock is held for the whole
    /// operation: concurrent readers block on it rather than racing
    /// the download.
    pub async fn download(&self, store: &dyn BlobStore, scratch: Option<&std::fs::File>) -> Result<()> {
        if !self.is_remote().await {
            return Ok(());
        }

        self.downloading.store(true, Ordering::SeqCst);
        let result = self.download_inner(store, scratch).await;
        self.downloading.store(false, Ordering::SeqCst);
        result
    }

    async fn download_inner(&self, store: &dyn BlobStore, scratch: Option<&std::fs::File>) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.state != ChunkState::Remote {
            // Another caller won the race while we waited for the lock.
            return Ok(());
        }

        let handle = inner.handle.clone().ok_or(FragfsError::MissingRemoteHandle)?;
        let bytes = store.download(&handle).await?;

        inner.state = ChunkState::Memory;
        inner.buffer = Some(bytes.clone());

        if let Some(file) = scratch {
            match file.write_all_at(&bytes, self.start) {
                Ok(()) => {
                    inner.state = ChunkState::Scratch;
                    inner.buffer = None;
                }
                Err(err) => {
                    // ScratchIOError: stays in MEMORY, reads still succeed.
                    warn!("failed to materialise chunk {} to scratch file: {}", self.idx, err);
                }
            }
        }

        Ok(())
    }

    /// Upload this chunk's in-memory bytes, transitioning MEMORY -> REMOTE.
    pub async fn send(&self, store: &dyn BlobStore) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.state != ChunkState::Memory {
            return Err(FragfsError::MissingRemoteHandle);
        }

        let bytes = inner.buffer.clone().ok_or(FragfsError::MissingRemoteHandle)?;
        let handle = store.upload(&self.name, bytes).await?;

        inner.handle = Some(handle);
        inner.buffer = None;
        inner.state = ChunkState::Remote;
        Ok(())
    }

    /// Read `[rel_start, rel_end)` relative to this chunk's own bytes.
    /// `REMOTE` is a programming error -- the caller must have ensured
    /// the chunk is materialised first; it is logged and yields no bytes.
    pub async fn read_range(&self, rel_start: u64, rel_end: u64, scratch: Option<&std::fs::File>) -> Bytes {
        if rel_start > rel_end || rel_end > self.size {
            error!(
                "chunk {}: out-of-range read [{}, {}) against size {}",
                self.idx, rel_start, rel_end, self.size
            );
            return Bytes::new();
        }
        if rel_start == rel_end {
            return Bytes::new();
        }

        let inner = self.inner.lock().await;
        let len = (rel_end - rel_start) as usize;

        match inner.state {
            ChunkState::Memory => match &inner.buffer {
                Some(buf) => buf.slice(rel_start as usize..rel_end as usize),
                None => {
                    error!("chunk {} is MEMORY with no buffer", self.idx);
                    Bytes::new()
                }
            },
            ChunkState::Scratch => {
                let Some(file) = scratch else {
                    error!("chunk {} is SCRATCH but parent has no scratch file open", self.idx);
                    return Bytes::new();
                };
                let mut buf = vec![0u8; len];
                match file.read_exact_at(&mut buf, self.start + rel_start) {
                    Ok(()) => Bytes::from(buf),
                    Err(err) => {
                        warn!("scratch read failed for chunk {}: {}", self.idx, err);
                        Bytes::new()
                    }
                }
            }
            ChunkState::Remote => {
                error!("chunk {} read while still REMOTE (caller bug)", self.idx);
                Bytes::new()
            }
        }
    }

    /// Release memory held by an idle chunk. MEMORY -> REMOTE drops the
    /// buffer; SCRATCH only drops a stale buffer reference, since the
    /// scratch file itself is owned by the parent.
    pub async fn prune_from_ram(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ChunkState::Memory => {
                trace!("pruning chunk {} from RAM", self.idx);
                inner.buffer = None;
                inner.state = ChunkState::Remote;
            }
            ChunkState::Scratch => {
                inner.buffer = None;
            }
            ChunkState::Remote => {}
        }
    }

    /// Invoked by the parent when its scratch file is deleted: every
    /// covered chunk reverts to REMOTE regardless of current state.
    pub async fn force_remote(&self) {
        let mut inner = self.inner.lock().await;
        inner.buffer = None;
        inner.state = ChunkState::Remote;
    }
}

pub type SharedChunk = Arc<Chunk>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeBlobStore;

    #[tokio::test]
    async fn send_then_download_roundtrips_bytes() {
        let store = FakeBlobStore::new();
        let chunk = Chunk::new_in_memory(0, "name-0".into(), 0, Bytes::from_static(b"hello"));

        chunk.send(&store).await.unwrap();
        assert_eq!(chunk.state().await, ChunkState::Remote);

        chunk.download(&store, None).await.unwrap();
        assert_eq!(chunk.state().await, ChunkState::Memory);

        let bytes = chunk.read_range(0, 5, None).await;
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn out_of_range_read_yields_empty_not_panic() {
        let chunk = Chunk::new_in_memory(0, "name-0".into(), 0, Bytes::from_static(b"hello"));
        let bytes = chunk.read_range(3, 10, None).await;
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn remote_read_yields_empty() {
        let chunk = Chunk::new_remote(0, 5, "name-0".into(), 0, "handle".into());
        let bytes = chunk.read_range(0, 5, None).await;
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn prune_from_ram_drops_buffer() {
        let chunk = Chunk::new_in_memory(0, "name-0".into(), 0, Bytes::from_static(b"hello"));
        // Give it a handle as if already uploaded, then prune.
        {
            let mut inner = chunk.inner.lock().await;
            inner.handle = Some("h".into());
        }
        chunk.prune_from_ram().await;
        assert_eq!(chunk.state().await, ChunkState::Remote);
    }

    #[tokio::test]
    async fn should_download_false_while_in_flight() {
        let chunk = Chunk::new_remote(0, 5, "name-0".into(), 0, "handle".into());
        assert!(chunk.should_download().await);
        chunk.downloading.store(true, Ordering::SeqCst);
        assert!(!chunk.should_download().await);
    }
}
