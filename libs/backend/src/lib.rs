//! The object-store backend contract consumed by the cloudfile core.
//!
//! [`Backend`] is a CRUD-like capability set that any concrete object
//! store (S3, Azure, a local directory) must satisfy. The core treats
//! all backends uniformly through [`AnyBackend`], an enum wrapper that
//! avoids dynamic dispatch on the hot path while still letting tests
//! swap in [`UnreliableWrapper`] to inject failures.
//!
//! Only the contract and a local-disk adapter live here: a production S3
//! or Azure adapter is out of scope for this crate and would be added as
//! another `AnyBackend` variant without touching the trait.
#![deny(unsafe_code)]

mod error;
mod local_disk;
mod simulate_failures;

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use error::BackendError;
pub use local_disk::LocalDiskBackend;
pub use simulate_failures::UnreliableWrapper;

/// An ASCII object key, as produced by the frontend's key layout (cloudfile
/// §4.4). Backends never construct these, only echo them back in listings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendKey(String);

impl BackendKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for BackendKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BackendKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

bitflags::bitflags! {
    /// Flags accompanying a [`Backend::get`] call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GetFlags: u32 {
        const DECRYPTED   = 1 << 0;
        const PRIORITIZE  = 1 << 1;
        const UNSYNCED    = 1 << 2;
        const BACKGROUND  = 1 << 3;
        const REBALANCE   = 1 << 4;
        const SCRUB       = 1 << 5;
        const REBUILD     = 1 << 6;
        const READAHEAD   = 1 << 7;
        const NO_THROTTLE = 1 << 8;
        const PREPEND_MD5 = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Flags accompanying a [`Backend::put`] call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PutFlags: u32 {
        const BACKGROUND = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Per-call status, returned alongside a successful [`Backend::get`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusBits: u32 {
        const SKIPPED      = 1 << 0;
        const REPAIRED     = 1 << 1;
        const REPAIR_ERROR = 1 << 2;
        const NOT_FOUND    = 1 << 3;
        const ENOSPC       = 1 << 4;
    }
}

/// Capability flags a backend advertises up front, so the frontend and
/// collector can pick batch sizes and parallelism without probing.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub has_transactions: bool,
    pub del_with_location_info: bool,
    pub ordered_del: bool,
    pub max_del_size: usize,
    pub num_del_parallel: usize,
}

/// Opaque per-object location hint returned by [`Backend::put`] when
/// [`Capabilities::del_with_location_info`] is set, and handed back on
/// [`Backend::del`] to save the backend a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocInfo(pub Vec<u8>);

#[derive(Debug, Clone)]
pub struct GetResult {
    pub found: bool,
    pub md5: Option<String>,
    pub status: StatusBits,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub md5: String,
    pub compressed_size: u64,
    pub locinfo: Option<LocInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelStatus {
    Deleted,
    NotFound,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ListedObject {
    pub key: BackendKey,
    pub md5: Option<String>,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// The backend contract. All byte payloads are opaque; keys are plain
/// ASCII strings produced by the frontend.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Download `key` into `out`, optionally checking the result against
    /// `expected_md5`. Returns `found: false` rather than an error when
    /// the object simply doesn't exist -- callers treat a missing
    /// optional block as implicit zero.
    async fn get(
        &self,
        key: &BackendKey,
        expected_md5: Option<&str>,
        flags: GetFlags,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<GetResult, BackendError>;

    /// Upload `src` as a new object under `key`.
    async fn put(
        &self,
        key: &BackendKey,
        src: &mut (dyn AsyncRead + Unpin + Send),
        flags: PutFlags,
    ) -> Result<PutResult, BackendError>;

    /// Delete a batch of keys. `locinfo[i]`, when present, corresponds to
    /// `keys[i]` and was returned by a prior `put`. Returns one status per
    /// input key, in input order.
    async fn del(
        &self,
        keys: &[BackendKey],
        locinfo: Option<&[Option<LocInfo>]>,
        background: bool,
    ) -> Result<Vec<DelStatus>, BackendError>;

    /// Enumerate every object in the backend. Used only for recovery /
    /// catalog-import; not on any hot path, so a vec-collecting signature
    /// is acceptable.
    async fn list(&self) -> Result<Vec<ListedObject>, BackendError>;

    /// Barrier: after this returns, every previously-acknowledged put/del
    /// is durable.
    async fn sync(&self) -> Result<(), BackendError>;

    fn capabilities(&self) -> Capabilities;
}

/// Every backend kind currently supported, wrapped so callers avoid `dyn
/// Backend` on the hot path. Mirrors the split between concrete backends
/// and an `Unreliable` test wrapper.
#[derive(Clone)]
pub enum AnyBackend {
    LocalDisk(Arc<LocalDiskBackend>),
    Unreliable(Arc<UnreliableWrapper>),
}

#[async_trait]
impl Backend for AnyBackend {
    async fn get(
        &self,
        key: &BackendKey,
        expected_md5: Option<&str>,
        flags: GetFlags,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<GetResult, BackendError> {
        match self {
            Self::LocalDisk(b) => b.get(key, expected_md5, flags, out).await,
            Self::Unreliable(b) => b.get(key, expected_md5, flags, out).await,
        }
    }

    async fn put(
        &self,
        key: &BackendKey,
        src: &mut (dyn AsyncRead + Unpin + Send),
        flags: PutFlags,
    ) -> Result<PutResult, BackendError> {
        match self {
            Self::LocalDisk(b) => b.put(key, src, flags).await,
            Self::Unreliable(b) => b.put(key, src, flags).await,
        }
    }

    async fn del(
        &self,
        keys: &[BackendKey],
        locinfo: Option<&[Option<LocInfo>]>,
        background: bool,
    ) -> Result<Vec<DelStatus>, BackendError> {
        match self {
            Self::LocalDisk(b) => b.del(keys, locinfo, background).await,
            Self::Unreliable(b) => b.del(keys, locinfo, background).await,
        }
    }

    async fn list(&self) -> Result<Vec<ListedObject>, BackendError> {
        match self {
            Self::LocalDisk(b) => b.list().await,
            Self::Unreliable(b) => b.list().await,
        }
    }

    async fn sync(&self) -> Result<(), BackendError> {
        match self {
            Self::LocalDisk(b) => b.sync().await,
            Self::Unreliable(b) => b.sync().await,
        }
    }

    fn capabilities(&self) -> Capabilities {
        match self {
            Self::LocalDisk(b) => b.capabilities(),
            Self::Unreliable(b) => b.capabilities(),
        }
    }
}

impl AnyBackend {
    pub fn local_disk(b: LocalDiskBackend) -> Self {
        Self::LocalDisk(Arc::new(b))
    }

    pub fn unreliable(inner: AnyBackend, fail_first: u64) -> Self {
        Self::Unreliable(Arc::new(UnreliableWrapper::new(inner, fail_first)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_key_roundtrips_through_display() {
        let k = BackendKey::new("b_00000001_0000000000000042");
        assert_eq!(k.as_str(), k.to_string());
    }
}
