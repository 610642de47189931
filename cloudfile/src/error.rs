//! Error taxonomy (spec §7): callers match on *kind*, not on which
//! concrete operation produced the error.

use cloudfile_backend::BackendError;

pub type Result<T> = std::result::Result<T, CloudFileError>;

#[derive(Debug, thiserror::Error)]
pub enum CloudFileError {
    /// Backend is unreachable or timed out. Foreground callers wrap their
    /// frontend calls in a deadline (`deadline_header`/`deadline_body` in
    /// [`crate::config::CloudFileConfig`]) and see this once that deadline
    /// elapses; background tasks (the collector, checkpoint retries) keep
    /// retrying at the backoff cap with no deadline of their own.
    #[error("transient backend error: {0}")]
    Transient(#[source] BackendError),

    /// The local cache device (or, in this implementation, the in-memory
    /// cache arena) could not service a read or write.
    #[error("cache device I/O error: {0}")]
    CacheIo(#[source] std::io::Error),

    /// MD5 mismatch, unexpected object size, or slog CRC failure.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// A catalog-referenced block or an expected checkpoint marker was
    /// missing. Distinct from a backend "not found" on an optional read,
    /// which is not an error at all (spec §7).
    #[error("expected object missing: {0}")]
    NotFound(String),

    /// The cache device's free space fell below the `min` watchdog band.
    #[error("cache device space exhausted")]
    SpaceExhausted,

    /// A broken internal invariant. Always a bug; the mount should stop.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),

    /// A checkpoint failed and the mount is refusing writes until the
    /// next one succeeds (spec.md §4.3).
    #[error("mount is read-only after a checkpoint failure")]
    ReadOnly,
}

impl From<BackendError> for CloudFileError {
    fn from(e: BackendError) -> Self {
        if e.is_not_found() {
            CloudFileError::NotFound(e.to_string())
        } else {
            CloudFileError::Transient(e)
        }
    }
}

impl CloudFileError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CloudFileError::Invariant(_))
    }
}
