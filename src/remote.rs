//! C1: Remote Blob Client.
//!
//! Uploads a chunk and gets back an opaque handle; resolves a handle
//! to a downloadable URL; downloads by handle. Enforces a fixed
//! concurrency cap on downloads and surfaces rate-limit hints as a
//! typed error rather than retrying internally -- retry policy is the
//! write streamer's job (C5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::error::{FragfsError, Result};

/// An opaque identifier the remote assigns to an uploaded chunk.
pub type Handle = String;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload `bytes` under the given local chunk name, returning the
    /// handle the remote assigned to it.
    async fn upload(&self, name: &str, bytes: Bytes) -> Result<Handle>;

    /// Resolve a handle to a URL the caller can download from. Most
    /// implementations fold this step into `download`.
    async fn resolve(&self, handle: &Handle) -> Result<String>;

    /// Download the bytes previously uploaded under `handle`.
    async fn download(&self, handle: &Handle) -> Result<Bytes>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    result: UploadResult,
}

#[derive(Debug, Deserialize)]
struct UploadResult {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    result: ResolveResult,
}

#[derive(Debug, Deserialize)]
struct ResolveResult {
    file_path: String,
}

/// `reqwest`-backed implementation of the wire protocol described in
/// `spec.md` §6: multipart upload with `chat_id`/`caption`/`document`
/// fields, and a two-call download (metadata lookup, then a GET).
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
    bucket: String,
    download_slots: Arc<Semaphore>,
}

impl HttpBlobStore {
    pub fn new(base_url: String, token: String, bucket: String, concurrency: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            token,
            bucket,
            download_slots: Arc::new(Semaphore::new(concurrency)),
        }
    }

    fn upload_url(&self) -> String {
        format!("{}/bot{}/sendDocument", self.base_url, self.token)
    }

    fn resolve_url(&self, handle: &Handle) -> String {
        format!("{}/bot{}/getFile?file_id={}", self.base_url, self.token, handle)
    }

    fn download_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.base_url, self.token, file_path)
    }

    /// Parse a trailing "... too many requests ... <secs>" error body
    /// into a retry-after duration, per the wire contract in `spec.md` §6.
    fn parse_rate_limit(body: &str) -> Option<Duration> {
        if !body.to_lowercase().contains("too many requests") {
            return None;
        }
        body.split_whitespace()
            .last()
            .and_then(|tok| tok.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, name: &str, bytes: Bytes) -> Result<Handle> {
        trace!("uploading {} bytes as `{}`", bytes.len(), name);

        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", self.bucket.clone())
            .text("caption", "chunk")
            .part("document", part);

        let resp = self
            .client
            .post(self.upload_url())
            .multipart(form)
            .send()
            .await
            .map_err(|err| FragfsError::TransientTransport(err.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if let Some(retry_after) = Self::parse_rate_limit(&body) {
                warn!("remote rate-limited upload of `{}`, retry after {:?}", name, retry_after);
                return Err(FragfsError::RateLimited(retry_after));
            }
            return Err(FragfsError::TransientTransport(format!(
                "upload failed: {} - {}",
                status, body
            )));
        }

        let parsed: UploadResponse = resp
            .json()
            .await
            .map_err(|err| FragfsError::TransientTransport(err.to_string()))?;

        debug!("uploaded `{}` -> handle {}", name, parsed.result.file_id);
        Ok(parsed.result.file_id)
    }

    async fn resolve(&self, handle: &Handle) -> Result<String> {
        let resp = self
            .client
            .get(self.resolve_url(handle))
            .send()
            .await
            .map_err(|err| FragfsError::TransientTransport(err.to_string()))?;

        if !resp.status().is_success() {
            return Err(FragfsError::TransientTransport(format!(
                "resolve failed: {}",
                resp.status()
            )));
        }

        let parsed: ResolveResponse = resp
            .json()
            .await
            .map_err(|err| FragfsError::TransientTransport(err.to_string()))?;

        Ok(self.download_url(&parsed.result.file_path))
    }

    async fn download(&self, handle: &Handle) -> Result<Bytes> {
        let _permit = self
            .download_slots
            .acquire()
            .await
            .expect("download semaphore never closed");

        let url = self.resolve(handle).await?;

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| FragfsError::TransientTransport(err.to_string()))?;

        if !resp.status().is_success() {
            return Err(FragfsError::TransientTransport(format!(
                "download failed: {}",
                resp.status()
            )));
        }

        resp.bytes()
            .await
            .map_err(|err| FragfsError::TransientTransport(err.to_string()))
    }
}

/// Test fixtures. Not `#[cfg(test)]` so integration tests under
/// `tests/` (a separate crate) can use them too.
pub mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// A scriptable in-memory blob store for unit and property tests.
    /// Each chunk name can be given a queue of canned outcomes for
    /// `upload`, consumed in order; once exhausted it always succeeds.
    /// Separately, `script_next_uploads` queues outcomes by call order
    /// rather than by name, for callers (like the write streamer) that
    /// generate a fresh random chunk name per upload and so can't
    /// address a script by name ahead of time.
    #[derive(Default)]
    pub struct FakeBlobStore {
        blobs: Mutex<HashMap<Handle, Bytes>>,
        next_handle: Mutex<u64>,
        upload_scripts: Mutex<HashMap<String, Vec<Result<()>>>>,
        sequenced_script: Mutex<VecDeque<Result<()>>>,
        download_slots: Arc<Semaphore>,
    }

    impl FakeBlobStore {
        pub fn new() -> Self {
            Self {
                blobs: Mutex::new(HashMap::new()),
                next_handle: Mutex::new(0),
                upload_scripts: Mutex::new(HashMap::new()),
                sequenced_script: Mutex::new(VecDeque::new()),
                download_slots: Arc::new(Semaphore::new(crate::config::DOWNLOAD_CONCURRENCY)),
            }
        }

        /// Queue outcomes for the next calls to `upload(name, ..)`.
        pub fn script_upload(&self, name: &str, outcomes: Vec<Result<()>>) {
            self.upload_scripts
                .lock()
                .unwrap()
                .insert(name.to_string(), outcomes);
        }

        /// Queue outcomes consumed by the next `upload` calls in order,
        /// regardless of chunk name. Exhausted once drained; later
        /// calls fall through to the per-name script, then to success.
        pub fn script_next_uploads(&self, outcomes: Vec<Result<()>>) {
            self.sequenced_script.lock().unwrap().extend(outcomes);
        }
    }

    #[async_trait]
    impl BlobStore for FakeBlobStore {
        async fn upload(&self, name: &str, bytes: Bytes) -> Result<Handle> {
            let sequenced = self.sequenced_script.lock().unwrap().pop_front();
            if let Some(outcome) = sequenced {
                outcome?;
            } else if let Some(script) = self.upload_scripts.lock().unwrap().get_mut(name) {
                if !script.is_empty() {
                    let outcome = script.remove(0);
                    outcome?;
                }
            }

            let mut next = self.next_handle.lock().unwrap();
            let handle = format!("fake-{}", *next);
            *next += 1;
            self.blobs.lock().unwrap().insert(handle.clone(), bytes);
            Ok(handle)
        }

        async fn resolve(&self, handle: &Handle) -> Result<String> {
            Ok(format!("fake://{}", handle))
        }

        async fn download(&self, handle: &Handle) -> Result<Bytes> {
            let _permit = self.download_slots.acquire().await.unwrap();
            self.blobs
                .lock()
                .unwrap()
                .get(handle)
                .cloned()
                .ok_or(FragfsError::MissingRemoteHandle)
        }
    }

    #[test]
    fn parses_retry_after_from_error_body() {
        let body = "420 too many requests: retry after 7";
        assert_eq!(
            HttpBlobStore::parse_rate_limit(body),
            Some(Duration::from_secs(7))
        );
        assert_eq!(HttpBlobStore::parse_rate_limit("internal error"), None);
    }
}
