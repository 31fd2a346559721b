//! C7: Catalog Synchroniser.
//!
//! Periodically reconciles the in-memory `Directory` with the catalog:
//! file-ids that appear in the catalog but not the directory are
//! restored and added; directory entries whose file-id has vanished
//! from the catalog are removed. Restores run in parallel; directory
//! mutations go through its own write-side lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, warn};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::catalog::Catalog;
use crate::chunked_file::ChunkedFile;
use crate::directory::Directory;

/// Run one reconciliation sweep. Exposed separately from `run` so
/// tests can drive a single pass deterministically.
pub async fn sync_once(catalog: &dyn Catalog, directory: &Directory, tmp_dir: &PathBuf) {
    let catalog_ids = match catalog.list().await {
        Ok(ids) => ids,
        Err(err) => {
            warn!("synchroniser: catalog list failed: {}", err);
            return;
        }
    };

    let known: Vec<String> = directory
        .committed_ids()
        .await
        .into_iter()
        .map(|(_, id)| id)
        .collect();

    let missing: Vec<&String> = catalog_ids.iter().filter(|id| !known.contains(id)).collect();

    let restores = missing
        .iter()
        .map(|id| ChunkedFile::restore(catalog, id, tmp_dir.clone()));
    let restored = join_all(restores).await;

    for result in restored {
        match result {
            Ok(file) => {
                debug!("synchroniser: restored `{}` ({})", file.filename, file.id);
                let filename = file.filename.clone();
                directory.insert_if_absent(&filename, file).await;
            }
            Err(err) => warn!("synchroniser: restore failed: {}", err),
        }
    }

    for (name, id) in directory.committed_ids().await {
        if !catalog_ids.contains(&id) {
            debug!("synchroniser: `{}` ({}) vanished from catalog, dropping", name, id);
            directory.remove_by_id(&id).await;
        }
    }
}

/// Spawn the periodic sweep as a background task. Returns the join
/// handle so the caller can await clean shutdown.
pub fn spawn(
    catalog: Arc<dyn Catalog>,
    directory: Arc<Directory>,
    tmp_dir: PathBuf,
    interval: Duration,
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
                    sync_once(catalog.as_ref(), directory.as_ref(), &tmp_dir).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("synchroniser: shutdown requested");
                        return;
                    }
                }
            }
        }
    })
}
