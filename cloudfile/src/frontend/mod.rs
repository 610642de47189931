//! Object-store frontend (spec.md §4.4): turns `(cd_id, BlockKey, transid)`
//! triples into backend objects, with a catalog of what's out there so the
//! cache rarely has to ask the backend "does this exist".

pub mod catalog;
pub mod key;
pub mod transaction;

use std::io::Cursor;
use std::time::Duration;

use cloudfile_backend::{AnyBackend, Backend, BackendError, BackendKey, GetFlags, PutFlags};
use tokio::io::AsyncReadExt;

use crate::config::CloudFileConfig;
use crate::error::{CloudFileError, Result};
use crate::types::{BlockKey, Generation, TransId};

pub use catalog::Catalog;

/// Outcome of a frontend `get`: the bytes (via `out`) plus which
/// transaction actually produced the version that satisfied the read, so
/// callers (the cache) can record provenance.
pub struct FrontendGetOutcome {
    pub found: bool,
    pub transid_of_version: Option<TransId>,
}

pub struct Frontend {
    backend: AnyBackend,
    catalog: Catalog,
    cd_id: Option<u64>,
    prefix_shard: bool,
    retry_base: Duration,
    retry_cap: Duration,
    deadline_header: Duration,
    deadline_body: Duration,
}

impl Frontend {
    pub fn new(backend: AnyBackend, catalog: Catalog, config: &CloudFileConfig) -> Self {
        Self {
            backend,
            catalog,
            cd_id: config.cd_id,
            prefix_shard: config.prefix_shard,
            retry_base: config.retry_base,
            retry_cap: config.retry_cap,
            deadline_header: config.deadline_header,
            deadline_body: config.deadline_body,
        }
    }

    /// Runs `f` with the uniform exponential-backoff retry policy (spec.md
    /// §7/§9): base `retry_base`, doubling, capped at `retry_cap`, no
    /// retry-count limit. Foreground callers bound overall latency with
    /// their own deadline wrapped around this call.
    async fn with_retry<T, F, Fut>(&self, op_name: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, cloudfile_backend::BackendError>>,
    {
        let mut delay = self.retry_base;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_not_found() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(op = op_name, error = %e, delay_ms = delay.as_millis() as u64, "backend op failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.retry_cap);
                }
            }
        }
    }

    /// Locates and downloads the newest object with `(cd_id, key, transid'
    /// <= transid)` from the backend, preferring the catalog over a
    /// backend probe. Writes decrypted cleartext bytes into `out`.
    pub async fn get(
        &self,
        block: BlockKey,
        transid: TransId,
        flags: GetFlags,
        out: &mut Vec<u8>,
    ) -> Result<FrontendGetOutcome> {
        let tkey = key::block_tkey(block);
        let row = tokio::time::timeout(self.deadline_header, self.catalog.newest_version(self.cd_id, &tkey, transid))
            .await
            .map_err(|_| self.deadline_error("catalog lookup", self.deadline_header))??;
        let Some(row) = row else {
            return Ok(FrontendGetOutcome {
                found: false,
                transid_of_version: None,
            });
        };
        if row.deleted {
            return Ok(FrontendGetOutcome {
                found: false,
                transid_of_version: None,
            });
        }

        let name = key::object_name(self.cd_id, row.trans_id, block, self.prefix_shard);
        let md5 = row.md5sum.clone();
        let (_result, bytes) = tokio::time::timeout(
            self.deadline_body,
            self.with_retry("frontend.get", || {
                let backend = &self.backend;
                let name = &name;
                let md5 = &md5;
                async move {
                    let mut cursor = Vec::new();
                    let result = backend.get(name, Some(md5), flags, &mut cursor).await?;
                    Ok((result, cursor))
                }
            }),
        )
        .await
        .map_err(|_| self.deadline_error("backend get", self.deadline_body))??;

        out.extend_from_slice(&bytes);
        Ok(FrontendGetOutcome {
            found: true,
            transid_of_version: Some(row.trans_id),
        })
    }

    /// Uploads a new version of `block` at `transid` and records it in the
    /// catalog. Returns the compressed size reported by the backend.
    pub async fn put(
        &self,
        block: BlockKey,
        transid: TransId,
        _generation: Generation,
        src: &[u8],
        flags: PutFlags,
    ) -> Result<u64> {
        let tkey = key::block_tkey(block);
        let name = key::object_name(self.cd_id, transid, block, self.prefix_shard);
        let owned = src.to_vec();

        let put_result = tokio::time::timeout(
            self.deadline_body,
            self.with_retry("frontend.put", || {
                let backend = &self.backend;
                let name = &name;
                let mut cursor = Cursor::new(owned.clone());
                async move { backend.put(name, &mut cursor, flags).await }
            }),
        )
        .await
        .map_err(|_| self.deadline_error("backend put", self.deadline_body))??;

        tokio::time::timeout(
            self.deadline_header,
            self.catalog.insert_object(&catalog::ObjectRow {
                cd_id: self.cd_id,
                trans_id: transid,
                tkey,
                md5sum: put_result.md5.clone(),
                size: put_result.compressed_size,
                last_modified: None,
                mirrored: false,
                deleted: false,
            }),
        )
        .await
        .map_err(|_| self.deadline_error("catalog insert", self.deadline_header))??;

        Ok(put_result.compressed_size)
    }

    /// Builds the `Transient`/`Transport` error a foreground `get`/`put`
    /// surfaces once its deadline elapses (spec.md §7).
    fn deadline_error(&self, what: &str, after: Duration) -> CloudFileError {
        CloudFileError::Transient(BackendError::Transport(anyhow::anyhow!("{what} timed out after {after:?}")))
    }

    /// Records delete markers for `blocks` in the catalog and batches the
    /// corresponding backend deletions.
    pub async fn del(&self, blocks: &[BlockKey], transid: TransId) -> Result<()> {
        let mut names = Vec::with_capacity(blocks.len());
        for &block in blocks {
            let tkey = key::block_tkey(block);
            self.catalog.mark_deleted(self.cd_id, transid, &tkey).await?;
            names.push(key::object_name(self.cd_id, transid, block, self.prefix_shard));
        }
        if !names.is_empty() {
            self.with_retry("frontend.del", || {
                let backend = &self.backend;
                let names = &names;
                async move { backend.del(names, None, false).await }
            })
            .await?;
        }
        Ok(())
    }

    pub async fn new_transaction(&self, next_id: TransId) -> Result<TransId> {
        transaction::new_transaction(&self.catalog, next_id).await
    }

    pub async fn transaction_finalize(&self, trans_id: TransId, complete: bool) -> Result<()> {
        transaction::transaction_finalize(&self.catalog, &self.backend, self.cd_id, trans_id, complete).await
    }

    pub async fn set_active_transactions(&self, active: &[TransId]) -> Result<()> {
        transaction::set_active_transactions(&self.catalog, &self.backend, self.cd_id, active).await
    }

    /// Direct backend handle for the collector, which deletes batches of
    /// raw object names that the catalog already knows are superseded
    /// rather than going through per-block `del`.
    pub fn backend_for_collector(&self) -> &AnyBackend {
        &self.backend
    }

    /// Shared catalog handle for the collector's task-queue polling.
    /// Safe to use concurrently with `get`/`put`/`del`: every catalog
    /// method takes its own lock internally.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Barrier: no previously-acknowledged put/del is lost after this
    /// returns (spec.md §4.4).
    pub async fn sync(&self) -> Result<()> {
        self.backend.sync().await.map_err(CloudFileError::from)
    }

    /// Enumerates every object in the backend; used only for recovery or
    /// catalog rebuild, never on the hot path.
    pub async fn list(&self) -> Result<Vec<cloudfile_backend::ListedObject>> {
        Ok(self.backend.list().await?)
    }

    /// Rebuilds the catalog from a backend enumeration when it's empty on
    /// startup and the caller has opted into import (spec.md §4.4).
    pub async fn rebuild_catalog_from_backend(&self) -> Result<()> {
        if !self.catalog.is_empty().await? {
            return Ok(());
        }
        tracing::info!("catalog empty on startup, rebuilding from backend listing");
        let objects = self.list().await?;
        for obj in objects {
            let name = obj.key.as_str();
            if let Some((cd_id, trans_id, hex_tkey)) = parse_object_name(name) {
                if let Ok(tkey) = hex::decode(hex_tkey) {
                    self.catalog
                        .insert_object(&catalog::ObjectRow {
                            cd_id,
                            trans_id,
                            tkey,
                            md5sum: obj.md5.unwrap_or_default(),
                            size: obj.size,
                            last_modified: None,
                            mirrored: false,
                            deleted: false,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// Best-effort inverse of [`key::object_name`] for markerless object
/// names, used only by catalog rebuild.
fn parse_object_name(name: &str) -> Option<(Option<u64>, TransId, &str)> {
    let trimmed = name.trim_start_matches(|c: char| c.is_ascii_hexdigit() || c == '/');
    let rest = if trimmed.len() < name.len() { trimmed } else { name };
    let mut parts = rest.rsplitn(3, '_');
    let hex_tkey = parts.next()?;
    let trans_part = parts.next()?;
    let trans_id = TransId(trans_part.parse().ok()?);
    let cd_id = parts.next().and_then(|s| s.parse().ok());
    Some((cd_id, trans_id, hex_tkey))
}

#[allow(dead_code)]
async fn drain_to_vec(mut reader: impl tokio::io::AsyncRead + Unpin) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudfile_backend::LocalDiskBackend;

    use crate::types::Tier;

    async fn new_frontend() -> (Frontend, camino_tempfile::TempDir) {
        let dir = camino_tempfile::tempdir().unwrap();
        let backend = AnyBackend::local_disk(LocalDiskBackend::new(dir.path().join("objects")).await.unwrap());
        let catalog = Catalog::open_in_memory().await.unwrap();
        let config = CloudFileConfig::default();
        (Frontend::new(backend, catalog, &config), dir)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let (frontend, _dir) = new_frontend().await;
        let block = BlockKey::new(Tier::Small, 7);
        frontend
            .put(block, TransId(1), Generation(1), b"payload bytes", PutFlags::empty())
            .await
            .unwrap();

        let mut out = Vec::new();
        let outcome = frontend.get(block, TransId(1), GetFlags::empty(), &mut out).await.unwrap();
        assert!(outcome.found);
        assert_eq!(outcome.transid_of_version, Some(TransId(1)));
        assert_eq!(out, b"payload bytes");
    }

    #[tokio::test]
    async fn get_before_any_write_reports_not_found() {
        let (frontend, _dir) = new_frontend().await;
        let mut out = Vec::new();
        let outcome = frontend
            .get(BlockKey::new(Tier::Small, 1), TransId(1), GetFlags::empty(), &mut out)
            .await
            .unwrap();
        assert!(!outcome.found);
    }

    #[tokio::test]
    async fn later_write_supersedes_earlier_one_for_readers_at_or_after() {
        let (frontend, _dir) = new_frontend().await;
        let block = BlockKey::new(Tier::Small, 1);
        frontend.put(block, TransId(1), Generation(1), b"v1", PutFlags::empty()).await.unwrap();
        frontend.put(block, TransId(2), Generation(2), b"v2", PutFlags::empty()).await.unwrap();

        let mut at1 = Vec::new();
        frontend.get(block, TransId(1), GetFlags::empty(), &mut at1).await.unwrap();
        assert_eq!(at1, b"v1");

        let mut at2 = Vec::new();
        frontend.get(block, TransId(2), GetFlags::empty(), &mut at2).await.unwrap();
        assert_eq!(at2, b"v2");
    }

    #[tokio::test]
    async fn del_hides_block_from_later_readers() {
        let (frontend, _dir) = new_frontend().await;
        let block = BlockKey::new(Tier::Small, 1);
        frontend.put(block, TransId(1), Generation(1), b"v1", PutFlags::empty()).await.unwrap();
        frontend.del(&[block], TransId(2)).await.unwrap();

        let mut out = Vec::new();
        let outcome = frontend.get(block, TransId(5), GetFlags::empty(), &mut out).await.unwrap();
        assert!(!outcome.found);
    }
}
