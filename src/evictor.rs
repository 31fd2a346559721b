//! C8: Evictor.
//!
//! Periodic sweep reclaiming RAM buffers of idle chunks and deleting
//! scratch files whose last-access age exceeds `FILE_TTL`.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::chunked_file::ChunkedFile;
use crate::directory::{Directory, Node};

/// Run one eviction sweep over every committed file in `directory`.
pub async fn evict_once(directory: &Directory, ram_ttl: Duration, file_ttl: Duration) {
    for (name, node) in directory.list().await {
        let Node::Committed(file) = node else { continue };
        evict_file(&name, &file, ram_ttl, file_ttl).await;
    }
}

async fn evict_file(name: &str, file: &Arc<ChunkedFile>, ram_ttl: Duration, file_ttl: Duration) {
    if file.scratch_exists() {
        if let Some(age) = file.scratch_age() {
            if age > file_ttl {
                debug!("evictor: scratch file for `{}` aged {:?}, deleting", name, age);
                file.evict_scratch().await;
            }
        }
    }

    if file.is_idle(ram_ttl).await {
        debug!("evictor: `{}` idle past RAM_TTL, pruning buffers", name);
        file.prune_ram().await;
    }
}

/// Spawn the periodic sweep as a background task.
pub fn spawn(
    directory: Arc<Directory>,
    interval: Duration,
    ram_ttl: Duration,
    file_ttl: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = IntervalStream::new(tokio::time::interval(interval));
        loop {
            tokio::select! {
                tick = ticks.next() => {
                    if tick.is_none() {
                        return;
                    }
                    evict_once(directory.as_ref(), ram_ttl, file_ttl).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("evictor: shutdown requested");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemCatalog;
    use crate::remote::fake::FakeBlobStore;
    use crate::write_streamer::WriteStreamer;

    #[tokio::test]
    async fn idle_file_gets_pruned_from_ram() {
        let directory = Directory::new();
        let store: Arc<FakeBlobStore> = Arc::new(FakeBlobStore::new());
        let streamer = WriteStreamer::new("a.bin".into(), 1024, store.clone());
        streamer.write(b"hello").await.unwrap();

        let catalog = MemCatalog::new();
        let tmp_dir = std::env::temp_dir().join("fragfs-evictor-test");
        let file = streamer.flush(&catalog, &tmp_dir).await.unwrap();
        directory.commit("a.bin", file.clone()).await;

        // Force `last_read` into the past by treating a zero TTL as
        // already-elapsed; this file has never been read so is
        // immediately idle under any TTL.
        evict_once(&directory, Duration::from_secs(0), Duration::from_secs(999_999)).await;

        assert_eq!(file.chunks[0].state().await, crate::chunk::ChunkState::Remote);
    }
}
