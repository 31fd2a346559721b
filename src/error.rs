//! Typed error kinds for the chunked file engine.
//!
//! Propagation policy is "fail the smallest unit": a chunk-level
//! failure shortens a read but never fails the whole open file, and
//! only a catalog persist failure on flush is promoted to an `EIO`
//! that reaches the caller.
//!
//! Two of `spec.md` §7's error kinds, `BufferRangeViolation` and
//! `ScratchIOError`, are semantic categories rather than constructed
//! variants here: both are logged and swallowed at the point they
//! occur (`chunk.rs`'s `read_range`/`download_inner`) since the spec
//! itself resolves them to "logged; yields empty bytes" / "logged;
//! stays in MEMORY" rather than an `Err` that propagates anywhere.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FragfsError {
    /// Attempted to upload a chunk that isn't in `MEMORY`, or download
    /// one with no remote handle recorded.
    #[error("chunk has no remote handle")]
    MissingRemoteHandle,

    /// The remote signalled a rate limit; the caller should sleep for
    /// exactly this long and retry. Never surfaced past the retry loop.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    /// Any other non-success response from the remote.
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// A catalog key write failed; carries the offending key.
    #[error("failed to write catalog key `{0}`")]
    CatalogKeyFailure(String),
}

impl FragfsError {
    /// Map to the errno the FUSE bridge should report to the kernel.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            FragfsError::MissingRemoteHandle => libc::EIO,
            FragfsError::RateLimited(_) => libc::EAGAIN,
            FragfsError::TransientTransport(_) => libc::EIO,
            FragfsError::CatalogKeyFailure(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, FragfsError>;
