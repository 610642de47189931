//! A [`crate::Backend`] wrapper that fails deterministically, for tests
//! that exercise the retry/backoff and at-most-one-fetch paths in the
//! cloudfile core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    AnyBackend, Backend, BackendError, BackendKey, Capabilities, DelStatus, GetFlags, GetResult,
    ListedObject, LocInfo, PutFlags, PutResult,
};

/// Wraps another backend and fails the first `fail_first` calls made
/// against each distinct key, then passes every call after that through.
/// Mirrors the teacher's `simulate_failures` module, used the same way:
/// wrap a real backend once at test setup, never touched again after
/// that.
pub struct UnreliableWrapper {
    inner: AnyBackend,
    fail_first: u64,
    attempts: Mutex<HashMap<String, u64>>,
    total_attempts: AtomicU64,
}

impl UnreliableWrapper {
    pub fn new(inner: AnyBackend, fail_first: u64) -> Self {
        Self {
            inner,
            fail_first,
            attempts: Mutex::new(HashMap::new()),
            total_attempts: AtomicU64::new(0),
        }
    }

    /// Total number of calls attempted across all operations, including
    /// the ones this wrapper turned into failures. Tests use this to
    /// assert at-most-one-fetch behaviour at the layer above.
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts.load(Ordering::Relaxed)
    }

    fn attempt(&self, key: &str) -> u64 {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn should_fail(&self, key: &str) -> bool {
        self.attempt(key) <= self.fail_first
    }
}

#[async_trait]
impl Backend for UnreliableWrapper {
    async fn get(
        &self,
        key: &BackendKey,
        expected_md5: Option<&str>,
        flags: GetFlags,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<GetResult, BackendError> {
        if self.should_fail(&format!("get:{key}")) {
            return Err(BackendError::Transport(anyhow::anyhow!(
                "simulated transient failure for get({key})"
            )));
        }
        self.inner.get(key, expected_md5, flags, out).await
    }

    async fn put(
        &self,
        key: &BackendKey,
        src: &mut (dyn AsyncRead + Unpin + Send),
        flags: PutFlags,
    ) -> Result<PutResult, BackendError> {
        if self.should_fail(&format!("put:{key}")) {
            return Err(BackendError::Transport(anyhow::anyhow!(
                "simulated transient failure for put({key})"
            )));
        }
        self.inner.put(key, src, flags).await
    }

    async fn del(
        &self,
        keys: &[BackendKey],
        locinfo: Option<&[Option<LocInfo>]>,
        background: bool,
    ) -> Result<Vec<DelStatus>, BackendError> {
        if self.should_fail("del:batch") {
            return Err(BackendError::Transport(anyhow::anyhow!(
                "simulated transient failure for del"
            )));
        }
        self.inner.del(keys, locinfo, background).await
    }

    async fn list(&self) -> Result<Vec<ListedObject>, BackendError> {
        if self.should_fail("list") {
            return Err(BackendError::Transport(anyhow::anyhow!(
                "simulated transient failure for list"
            )));
        }
        self.inner.list().await
    }

    async fn sync(&self) -> Result<(), BackendError> {
        if self.should_fail("sync") {
            return Err(BackendError::Transport(anyhow::anyhow!(
                "simulated transient failure for sync"
            )));
        }
        self.inner.sync().await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalDiskBackend;

    #[tokio::test]
    async fn fails_exactly_fail_first_times_per_key() {
        let dir = camino_tempfile::tempdir().unwrap();
        let local = LocalDiskBackend::new(dir.path().to_path_buf()).await.unwrap();
        let wrapped = UnreliableWrapper::new(AnyBackend::local_disk(local), 2);

        let key = BackendKey::new("k");
        let mut src: &[u8] = b"abc";
        assert!(wrapped.put(&key, &mut src, PutFlags::empty()).await.is_err());
        let mut src: &[u8] = b"abc";
        assert!(wrapped.put(&key, &mut src, PutFlags::empty()).await.is_err());
        let mut src: &[u8] = b"abc";
        assert!(wrapped.put(&key, &mut src, PutFlags::empty()).await.is_ok());
    }
}
