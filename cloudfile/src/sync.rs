//! Blocking facade over [`crate::CloudFile`] for callers that are not
//! themselves async (spec.md §5): every method hands off to the
//! captured `tokio::runtime::Handle` with `block_on` rather than
//! spinning up a second runtime. Never call these from inside an async
//! context that runs on the same runtime -- that deadlocks.

use std::sync::Arc;

use cloudfile_backend::AnyBackend;
use tokio::runtime::Handle;

use crate::config::CloudFileConfig;
use crate::error::Result;
use crate::types::TransId;
use crate::CloudFile;

/// Synchronous handle wrapping a [`CloudFile`] mount. Holds an `Arc` so
/// clones are cheap and share the same cache/collector.
#[derive(Clone)]
pub struct BlockingCloudFile {
    inner: Arc<CloudFile>,
    handle: Handle,
}

impl BlockingCloudFile {
    /// Opens a mount on the given `handle`'s runtime. `handle` must stay
    /// alive for the lifetime of the returned value.
    pub fn open(handle: Handle, backend: AnyBackend, config: CloudFileConfig) -> Result<Self> {
        let inner = handle.block_on(CloudFile::open(backend, config))?;
        Ok(Self {
            inner: Arc::new(inner),
            handle,
        })
    }

    pub fn read(&self, pos: u64, len: u64) -> Result<Vec<u8>> {
        self.handle.block_on(self.inner.read(pos, len))
    }

    pub fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.handle.block_on(self.inner.write(pos, data))
    }

    pub fn punch_hole(&self, pos: u64, len: u64) -> Result<()> {
        self.handle.block_on(self.inner.punch_hole(pos, len))
    }

    pub fn resize(&self, new_size: u64) -> Result<()> {
        self.handle.block_on(self.inner.resize(new_size))
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn checkpoint(&self, do_submit: bool, retry_n: u32) -> Result<TransId> {
        self.handle.block_on(self.inner.checkpoint(do_submit, retry_n))
    }

    /// Drops the last handle to `inner` and stops the collector. Other
    /// clones keep the mount alive until they too are dropped.
    pub fn close(self) {
        if let Ok(inner) = Arc::try_unwrap(self.inner) {
            self.handle.block_on(inner.close());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudfile_backend::LocalDiskBackend;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap()
    }

    #[test]
    fn write_then_read_roundtrips_through_blocking_facade() {
        let rt = runtime();
        let dir = camino_tempfile::tempdir().unwrap();
        let handle = rt.handle().clone();

        let backend = handle.block_on(async { AnyBackend::local_disk(LocalDiskBackend::new(dir.path().join("objects")).await.unwrap()) });
        let config = CloudFileConfig {
            cache_dir: dir.path().join("cache"),
            ..Default::default()
        };

        let cf = BlockingCloudFile::open(handle, backend, config).unwrap();
        cf.resize(1 << 20).unwrap();
        cf.write(0, b"hello from a blocking caller").unwrap();
        let out = cf.read(0, 28).unwrap();
        assert_eq!(out, b"hello from a blocking caller");
    }
}
