//! C6: Directory / Node Layer.
//!
//! A flat `{filename -> node}` map. Dispatches reads to a committed
//! file's `ChunkedFile` (C4) and writes to an in-progress node's
//! `WriteStreamer` (C5). `unlink` is deliberately absent: files only
//! leave the map when the Synchroniser (C7) notices they vanished from
//! the catalog.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::chunked_file::ChunkedFile;
use crate::error::{FragfsError, Result};
use crate::remote::BlobStore;
use crate::write_streamer::WriteStreamer;

/// `S_IFDIR|0o755`.
pub const ROOT_MODE: u32 = 0o755 | 0o040000;
/// `S_IFREG|0o444`, committed files are read-only.
pub const COMMITTED_FILE_MODE: u32 = 0o444 | 0o100000;

/// One entry in the directory: either a finished file served out of
/// C4, or a write in progress being streamed into C5.
#[derive(Clone)]
pub enum Node {
    Committed(Arc<ChunkedFile>),
    InProgress(Arc<WriteStreamer>, u32),
}

impl Node {
    pub fn mode(&self) -> u32 {
        match self {
            Node::Committed(_) => COMMITTED_FILE_MODE,
            Node::InProgress(_, mode) => mode | 0o100000,
        }
    }

    pub async fn size(&self) -> u64 {
        match self {
            Node::Committed(file) => file.original_size,
            Node::InProgress(streamer, _) => streamer.bytes_written(),
        }
    }
}

/// Process-wide `{filename -> Node}` mapping, single-writer/many-reader.
#[derive(Default)]
pub struct Directory {
    children: RwLock<HashMap<String, Node>>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            children: RwLock::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, name: &str) -> Option<Node> {
        self.children.read().await.get(name).cloned()
    }

    /// Enumerate children for `readdir`, in no particular order.
    pub async fn list(&self) -> Vec<(String, Node)> {
        self.children
            .read()
            .await
            .iter()
            .map(|(name, node)| (name.clone(), node.clone()))
            .collect()
    }

    /// Allocate a fresh write-in-progress node under `name`, overwriting
    /// any existing entry (catalog and directory both get re-mapped, per
    /// the filename-uniqueness rule).
    pub async fn create(&self, name: &str, mode: u32, chunk_size: u64, store: Arc<dyn BlobStore>) -> Arc<WriteStreamer> {
        let streamer = Arc::new(WriteStreamer::new(name.to_string(), chunk_size, store));
        self.children
            .write()
            .await
            .insert(name.to_string(), Node::InProgress(streamer.clone(), mode));
        streamer
    }

    /// Replace an in-progress node with its committed `ChunkedFile`
    /// once the write streamer has flushed.
    pub async fn commit(&self, name: &str, file: Arc<ChunkedFile>) {
        self.children
            .write()
            .await
            .insert(name.to_string(), Node::Committed(file));
    }

    /// Insert a file restored from the catalog (C7), keyed by its
    /// original filename, unless a node already claims that name.
    pub async fn insert_if_absent(&self, name: &str, file: Arc<ChunkedFile>) {
        let mut children = self.children.write().await;
        children.entry(name.to_string()).or_insert(Node::Committed(file));
    }

    pub async fn remove(&self, name: &str) {
        self.children.write().await.remove(name);
    }

    /// File-ids of every committed node, for the Synchroniser's
    /// catalog-vs-directory diff.
    pub async fn committed_ids(&self) -> Vec<(String, String)> {
        self.children
            .read()
            .await
            .iter()
            .filter_map(|(name, node)| match node {
                Node::Committed(file) => Some((name.clone(), file.id.clone())),
                Node::InProgress(..) => None,
            })
            .collect()
    }

    pub async fn remove_by_id(&self, file_id: &str) {
        self.children
            .write()
            .await
            .retain(|_, node| !matches!(node, Node::Committed(file) if file.id == file_id));
    }
}

/// Dispatch a read against a looked-up node, refusing reads of files
/// still being written (no guarantee per `spec.md` §4.6).
pub async fn read(node: &Node, off: u64, len: u64, store: Arc<dyn BlobStore>) -> Result<Bytes> {
    match node {
        Node::Committed(file) => Ok(file.read_range(off, len, store).await),
        Node::InProgress(..) => Err(FragfsError::MissingRemoteHandle),
    }
}

/// Dispatch a write; refused with `EROFS` at the `mountpoint` layer if
/// the node is already committed.
pub async fn write(node: &Node, data: &[u8]) -> Result<()> {
    match node {
        Node::InProgress(streamer, _) => streamer.write(data).await,
        Node::Committed(_) => Err(FragfsError::MissingRemoteHandle),
    }
}
