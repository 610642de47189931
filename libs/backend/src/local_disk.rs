//! A local-directory [`crate::Backend`], used for tests and single-host
//! mounts. Every key maps to one regular file under `root`; `put` writes
//! to a temp file and renames into place so a crash never observes a
//! half-written object.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    BackendError, BackendKey, Capabilities, DelStatus, GetFlags, GetResult, ListedObject, LocInfo,
    PutFlags, PutResult,
};

pub struct LocalDiskBackend {
    root: Utf8PathBuf,
    // Tracks md5 sums so `get(expected_md5=Some(_))` and listings don't need
    // to re-hash on every call. Keyed by the same string as the on-disk
    // filename.
    digests: Mutex<BTreeMap<String, String>>,
}

impl LocalDiskBackend {
    pub async fn new(root: Utf8PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            digests: Mutex::new(BTreeMap::new()),
        })
    }

    fn path_for(&self, key: &BackendKey) -> Utf8PathBuf {
        self.root.join(key.as_str())
    }

    fn tmp_path_for(&self, key: &BackendKey) -> Utf8PathBuf {
        self.root.join(format!(".{}.tmp", key.as_str()))
    }
}

#[async_trait]
impl crate::Backend for LocalDiskBackend {
    async fn get(
        &self,
        key: &BackendKey,
        expected_md5: Option<&str>,
        _flags: GetFlags,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<GetResult, BackendError> {
        let path = self.path_for(key);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GetResult {
                    found: false,
                    md5: None,
                    status: crate::StatusBits::NOT_FOUND,
                });
            }
            Err(e) => return Err(BackendError::Transport(e.into())),
        };

        let mut hasher = md5::Context::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| BackendError::Transport(e.into()))?;
            if n == 0 {
                break;
            }
            hasher.consume(&buf[..n]);
            out.write_all(&buf[..n])
                .await
                .map_err(|e| BackendError::Transport(e.into()))?;
        }
        let digest = format!("{:x}", hasher.compute());

        if let Some(expected) = expected_md5 {
            if expected != digest {
                return Err(BackendError::IntegrityMismatch {
                    key: key.to_string(),
                    expected: expected.to_string(),
                    actual: digest,
                });
            }
        }

        Ok(GetResult {
            found: true,
            md5: Some(digest),
            status: crate::StatusBits::empty(),
        })
    }

    async fn put(
        &self,
        key: &BackendKey,
        src: &mut (dyn AsyncRead + Unpin + Send),
        _flags: PutFlags,
    ) -> Result<PutResult, BackendError> {
        let tmp_path = self.tmp_path_for(key);
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;

        let mut hasher = md5::Context::new();
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = src
                .read(&mut buf)
                .await
                .map_err(|e| BackendError::Transport(e.into()))?;
            if n == 0 {
                break;
            }
            hasher.consume(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(|e| BackendError::Transport(e.into()))?;
            total += n as u64;
        }
        file.sync_all()
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;
        drop(file);

        let final_path = self.path_for(key);
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;

        let digest = format!("{:x}", hasher.compute());
        self.digests
            .lock()
            .unwrap()
            .insert(key.as_str().to_string(), digest.clone());

        Ok(PutResult {
            md5: digest,
            compressed_size: total,
            locinfo: Some(LocInfo(final_path.as_str().as_bytes().to_vec())),
        })
    }

    async fn del(
        &self,
        keys: &[BackendKey],
        _locinfo: Option<&[Option<LocInfo>]>,
        _background: bool,
    ) -> Result<Vec<DelStatus>, BackendError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.path_for(key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => out.push(DelStatus::Deleted),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    out.push(DelStatus::NotFound)
                }
                Err(_) => out.push(DelStatus::Failed),
            }
            self.digests.lock().unwrap().remove(key.as_str());
        }
        Ok(out)
    }

    async fn list(&self) -> Result<Vec<ListedObject>, BackendError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| BackendError::Transport(e.into()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackendError::Transport(e.into()))?
        {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name.starts_with('.') {
                continue; // in-flight temp file from a concurrent put
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| BackendError::Transport(e.into()))?;
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().ok();
            let md5 = self.digests.lock().unwrap().get(name.as_ref()).cloned();
            out.push(ListedObject {
                key: BackendKey::new(name.into_owned()),
                md5,
                size: meta.len(),
                mtime: mtime.or(Some(SystemTime::now())),
            });
        }
        Ok(out)
    }

    async fn sync(&self) -> Result<(), BackendError> {
        // Every write already went through sync_all + rename above, so
        // there's nothing outstanding to flush.
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_transactions: true,
            del_with_location_info: true,
            ordered_del: false,
            max_del_size: 1000,
            num_del_parallel: 4,
        }
    }
}

#[allow(dead_code)]
fn assert_relative(path: &Utf8Path) {
    debug_assert!(path.is_relative());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backend;

    #[tokio::test]
    async fn put_then_get_roundtrips_and_checks_md5() {
        let dir = camino_tempfile::tempdir().unwrap();
        let backend = LocalDiskBackend::new(dir.path().to_path_buf()).await.unwrap();

        let key = BackendKey::new("b_0000000000000001_00");
        let mut src: &[u8] = b"hello cloudfile";
        let put_result = backend.put(&key, &mut src, PutFlags::empty()).await.unwrap();
        assert_eq!(put_result.compressed_size, 15);

        let mut out = Vec::new();
        let get_result = backend
            .get(&key, Some(&put_result.md5), GetFlags::empty(), &mut out)
            .await
            .unwrap();
        assert!(get_result.found);
        assert_eq!(out, b"hello cloudfile");
    }

    #[tokio::test]
    async fn get_missing_key_reports_not_found_without_erroring() {
        let dir = camino_tempfile::tempdir().unwrap();
        let backend = LocalDiskBackend::new(dir.path().to_path_buf()).await.unwrap();
        let mut out = Vec::new();
        let result = backend
            .get(&BackendKey::new("missing"), None, GetFlags::empty(), &mut out)
            .await
            .unwrap();
        assert!(!result.found);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn del_nonexistent_key_reports_not_found() {
        let dir = camino_tempfile::tempdir().unwrap();
        let backend = LocalDiskBackend::new(dir.path().to_path_buf()).await.unwrap();
        let statuses = backend
            .del(&[BackendKey::new("nope")], None, false)
            .await
            .unwrap();
        assert_eq!(statuses, vec![DelStatus::NotFound]);
    }
}
