//! C2: Catalog Store.
//!
//! Persists and restores per-file and per-chunk metadata under the
//! key schema of `spec.md` §6, and enumerates all file identifiers.
//! Reads that return empty values yield an empty-valued field rather
//! than an error, so a restore of a partially-written entry degrades
//! visibly instead of crashing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::Client;
use log::warn;

use crate::error::{FragfsError, Result};

pub const KEY_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything persisted about a `ChunkedFile`'s three `/cf/<id>/*` keys.
#[derive(Debug, Clone, Default)]
pub struct FileRecord {
    pub filename: String,
    pub size: u64,
    pub num_chunks: u32,
}

/// Everything persisted about a single chunk's three `/ci/<id>/<idx>/*` keys.
#[derive(Debug, Clone, Default)]
pub struct ChunkRecord {
    pub size: u64,
    pub name: String,
    pub handle: String,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// All file-ids known to the catalog, by scanning `/cf/`.
    async fn list(&self) -> Result<Vec<String>>;

    async fn restore_file(&self, file_id: &str) -> Result<FileRecord>;

    async fn restore_chunk(&self, file_id: &str, idx: u32) -> Result<ChunkRecord>;

    async fn persist_file(&self, file_id: &str, record: &FileRecord) -> Result<()>;

    async fn persist_chunk(&self, file_id: &str, idx: u32, record: &ChunkRecord) -> Result<()>;

    /// Delete every `/cf/<id>/*` and `/ci/<id>/*` key. Used by the
    /// synchroniser's counterpart (it is the directory, not the
    /// catalog, that removes entries when *files vanish from the
    /// catalog*); this is for the inverse: an external deletion of a
    /// catalog entry.
    async fn remove_file(&self, file_id: &str) -> Result<()>;
}

fn cf_key(file_id: &str, field: &str) -> String {
    format!("/cf/{}/{}", file_id, field)
}

fn ci_key(file_id: &str, idx: u32, field: &str) -> String {
    format!("/ci/{}/{}/{}", file_id, idx, field)
}

/// `etcd-client`-backed implementation.
pub struct EtcdCatalog {
    client: Client,
}

impl EtcdCatalog {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = tokio::time::timeout(Duration::from_secs(10), Client::connect(endpoints, None))
            .await
            .map_err(|_| FragfsError::TransientTransport("etcd dial timeout".into()))?
            .map_err(|err| FragfsError::TransientTransport(err.to_string()))?;
        Ok(Self { client })
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut client = self.client.clone();
        tokio::time::timeout(KEY_TIMEOUT, client.put(key, value, None))
            .await
            .map_err(|_| FragfsError::CatalogKeyFailure(key.to_string()))?
            .map_err(|_| FragfsError::CatalogKeyFailure(key.to_string()))?;
        Ok(())
    }

    /// Empty string on a miss -- never an error, per §4.2's "reads
    /// that return empty values yield an empty-valued field".
    async fn get(&self, key: &str) -> String {
        let mut client = self.client.clone();
        match tokio::time::timeout(KEY_TIMEOUT, client.get(key, None)).await {
            Ok(Ok(resp)) => resp
                .kvs()
                .first()
                .and_then(|kv| kv.value_str().ok())
                .unwrap_or_default()
                .to_string(),
            _ => {
                warn!("catalog read of `{}` failed or timed out, treating as empty", key);
                String::new()
            }
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut client = self.client.clone();
        tokio::time::timeout(
            KEY_TIMEOUT,
            client.delete(prefix, Some(etcd_client::DeleteOptions::new().with_prefix())),
        )
        .await
        .map_err(|_| FragfsError::CatalogKeyFailure(prefix.to_string()))?
        .map_err(|_| FragfsError::CatalogKeyFailure(prefix.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Catalog for EtcdCatalog {
    async fn list(&self) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let resp = tokio::time::timeout(
            KEY_TIMEOUT,
            client.get("/cf/", Some(etcd_client::GetOptions::new().with_prefix())),
        )
        .await
        .map_err(|_| FragfsError::CatalogKeyFailure("/cf/".into()))?
        .map_err(|_| FragfsError::CatalogKeyFailure("/cf/".into()))?;

        let mut ids = Vec::new();
        for kv in resp.kvs() {
            if let Ok(key) = kv.key_str() {
                if let Some(id) = key.split('/').nth(2) {
                    if !ids.contains(&id.to_string()) {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn restore_file(&self, file_id: &str) -> Result<FileRecord> {
        let filename = self.get(&cf_key(file_id, "filename")).await;
        let size = self
            .get(&cf_key(file_id, "size"))
            .await
            .parse()
            .unwrap_or(0);
        let num_chunks = self
            .get(&cf_key(file_id, "num_chunks"))
            .await
            .parse()
            .unwrap_or(0);
        Ok(FileRecord {
            filename,
            size,
            num_chunks,
        })
    }

    async fn restore_chunk(&self, file_id: &str, idx: u32) -> Result<ChunkRecord> {
        let size = self
            .get(&ci_key(file_id, idx, "size"))
            .await
            .parse()
            .unwrap_or(0);
        let name = self.get(&ci_key(file_id, idx, "name")).await;
        let handle = self.get(&ci_key(file_id, idx, "file_id")).await;
        Ok(ChunkRecord { size, name, handle })
    }

    async fn persist_file(&self, file_id: &str, record: &FileRecord) -> Result<()> {
        self.put(&cf_key(file_id, "filename"), &record.filename).await?;
        self.put(&cf_key(file_id, "size"), &record.size.to_string()).await?;
        self.put(&cf_key(file_id, "num_chunks"), &record.num_chunks.to_string())
            .await?;
        Ok(())
    }

    async fn persist_chunk(&self, file_id: &str, idx: u32, record: &ChunkRecord) -> Result<()> {
        self.put(&ci_key(file_id, idx, "size"), &record.size.to_string()).await?;
        self.put(&ci_key(file_id, idx, "name"), &record.name).await?;
        self.put(&ci_key(file_id, idx, "file_id"), &record.handle).await?;
        Ok(())
    }

    async fn remove_file(&self, file_id: &str) -> Result<()> {
        self.delete_prefix(&format!("/cf/{}/", file_id)).await?;
        self.delete_prefix(&format!("/ci/{}/", file_id)).await?;
        Ok(())
    }
}

/// In-memory catalog for unit and integration tests. Shares the
/// empty-on-miss semantics of the real store.
pub struct MemCatalog {
    keys: tokio::sync::RwLock<HashMap<String, String>>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self {
            keys: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn list(&self) -> Result<Vec<String>> {
        let keys = self.keys.read().await;
        let mut ids = Vec::new();
        for key in keys.keys() {
            if let Some(rest) = key.strip_prefix("/cf/") {
                if let Some(id) = rest.split('/').next() {
                    if !ids.contains(&id.to_string()) {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn restore_file(&self, file_id: &str) -> Result<FileRecord> {
        let keys = self.keys.read().await;
        Ok(FileRecord {
            filename: keys.get(&cf_key(file_id, "filename")).cloned().unwrap_or_default(),
            size: keys
                .get(&cf_key(file_id, "size"))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            num_chunks: keys
                .get(&cf_key(file_id, "num_chunks"))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }

    async fn restore_chunk(&self, file_id: &str, idx: u32) -> Result<ChunkRecord> {
        let keys = self.keys.read().await;
        Ok(ChunkRecord {
            size: keys
                .get(&ci_key(file_id, idx, "size"))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            name: keys.get(&ci_key(file_id, idx, "name")).cloned().unwrap_or_default(),
            handle: keys.get(&ci_key(file_id, idx, "file_id")).cloned().unwrap_or_default(),
        })
    }

    async fn persist_file(&self, file_id: &str, record: &FileRecord) -> Result<()> {
        let mut keys = self.keys.write().await;
        keys.insert(cf_key(file_id, "filename"), record.filename.clone());
        keys.insert(cf_key(file_id, "size"), record.size.to_string());
        keys.insert(cf_key(file_id, "num_chunks"), record.num_chunks.to_string());
        Ok(())
    }

    async fn persist_chunk(&self, file_id: &str, idx: u32, record: &ChunkRecord) -> Result<()> {
        let mut keys = self.keys.write().await;
        keys.insert(ci_key(file_id, idx, "size"), record.size.to_string());
        keys.insert(ci_key(file_id, idx, "name"), record.name.clone());
        keys.insert(ci_key(file_id, idx, "file_id"), record.handle.clone());
        Ok(())
    }

    async fn remove_file(&self, file_id: &str) -> Result<()> {
        let mut keys = self.keys.write().await;
        let cf_prefix = format!("/cf/{}/", file_id);
        let ci_prefix = format!("/ci/{}/", file_id);
        keys.retain(|k, _| !k.starts_with(&cf_prefix) && !k.starts_with(&ci_prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_file_and_chunk_records() {
        let catalog = MemCatalog::new();
        let record = FileRecord {
            filename: "a.bin".into(),
            size: 42,
            num_chunks: 2,
        };
        catalog.persist_file("id1", &record).await.unwrap();
        let chunk = ChunkRecord {
            size: 21,
            name: "local-name".into(),
            handle: "handle-1".into(),
        };
        catalog.persist_chunk("id1", 0, &chunk).await.unwrap();

        let restored = catalog.restore_file("id1").await.unwrap();
        assert_eq!(restored.filename, "a.bin");
        assert_eq!(restored.size, 42);
        assert_eq!(restored.num_chunks, 2);

        let restored_chunk = catalog.restore_chunk("id1", 0).await.unwrap();
        assert_eq!(restored_chunk.name, "local-name");
        assert_eq!(restored_chunk.handle, "handle-1");

        assert_eq!(catalog.list().await.unwrap(), vec!["id1".to_string()]);
    }

    #[tokio::test]
    async fn missing_keys_degrade_to_empty_values() {
        let catalog = MemCatalog::new();
        let restored = catalog.restore_file("missing").await.unwrap();
        assert_eq!(restored.filename, "");
        assert_eq!(restored.size, 0);
    }

    #[tokio::test]
    async fn remove_file_clears_both_prefixes() {
        let catalog = MemCatalog::new();
        catalog
            .persist_file(
                "id1",
                &FileRecord {
                    filename: "a.bin".into(),
                    size: 1,
                    num_chunks: 1,
                },
            )
            .await
            .unwrap();
        catalog
            .persist_chunk(
                "id1",
                0,
                &ChunkRecord {
                    size: 1,
                    name: "n".into(),
                    handle: "h".into(),
                },
            )
            .await
            .unwrap();

        catalog.remove_file("id1").await.unwrap();
        assert!(catalog.list().await.unwrap().is_empty());
        assert_eq!(catalog.restore_chunk("id1", 0).await.unwrap().handle, "");
    }
}
