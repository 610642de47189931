//! cloudfile: a cloud-object-store-backed block device core.
//!
//! Three tightly coupled subsystems, wired together by [`CloudFile`]:
//! the [`volume`] layer (logical byte-range operations), the
//! [`cache`] (transactional residency + checkpoint), and the
//! [`frontend`] (object naming, catalog, transaction lifecycle) sitting
//! on top of a pluggable `cloudfile_backend::Backend`.

pub mod bitmap;
pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod extent_lock;
pub mod frontend;
pub mod slog;
pub mod sync;
pub mod types;
pub mod volume;
pub mod waitmap;

use std::sync::Arc;

use camino::Utf8PathBuf;
use cloudfile_backend::AnyBackend;

use cache::Cache;
use collector::{Collector, Interlocks};
use config::CloudFileConfig;
use error::{CloudFileError, Result};
use frontend::{Catalog, Frontend};
use types::{Generation, Tier, TransId, CELL_SIZE};
use volume::Volume;

const CLOUDFILE_SIZE_FILE: &str = "cloudfile_size";
const FINE_BITMAP_FILE: &str = "bitmap";
const BIG_BITMAP_FILE: &str = "big_blocks_bitmap";
const OLD_BIG_BITMAP_FILE: &str = "old_big_blocks_bitmap";
const OBJECTS_DB_FILE: &str = "objects.db";
const SLOG_FILE: &str = "slog";

/// Top-level handle to one mounted volume. Owns the cache, frontend,
/// bitmaps, and slog; the background collector runs alongside it.
pub struct CloudFile {
    volume: Arc<Volume>,
    cache: Arc<Cache>,
    frontend: Arc<Frontend>,
    fine_bitmap: Arc<bitmap::BitmapStore>,
    big_bitmap: Arc<bitmap::BitmapStore>,
    old_big_bitmap: Arc<bitmap::BitmapStore>,
    cache_dir: Utf8PathBuf,
    collector_cancel: Arc<tokio::sync::Notify>,
    interlocks: Arc<Interlocks>,
}

impl CloudFile {
    /// Opens (or initializes, if the cache dir is empty) a mount against
    /// `backend`. If the catalog is empty, the frontend's catalog is
    /// rebuilt from a backend listing (spec.md §4.4).
    pub async fn open(backend: AnyBackend, config: CloudFileConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.cache_dir)
            .await
            .map_err(CloudFileError::CacheIo)?;

        let size = Self::read_or_init_size(&config.cache_dir).await?;

        let fine_bits = size.div_ceil(CELL_SIZE);
        let big_blocks = size.div_ceil(Tier::Big.block_size());
        let max_resident_pages = (config.cache_size_bytes / bitmap::PAGE_SIZE as u64).clamp(16, 4096) as usize;

        let fine_bitmap = Arc::new(
            bitmap::BitmapStore::open(&config.cache_dir.join(FINE_BITMAP_FILE), fine_bits, max_resident_pages)
                .await
                .map_err(CloudFileError::CacheIo)?,
        );
        let big_bitmap = Arc::new(
            bitmap::BitmapStore::open(&config.cache_dir.join(BIG_BITMAP_FILE), big_blocks, max_resident_pages)
                .await
                .map_err(CloudFileError::CacheIo)?,
        );
        let old_big_bitmap = Arc::new(
            bitmap::BitmapStore::open(&config.cache_dir.join(OLD_BIG_BITMAP_FILE), big_blocks, max_resident_pages)
                .await
                .map_err(CloudFileError::CacheIo)?,
        );

        let catalog = Catalog::open(&config.cache_dir.join(OBJECTS_DB_FILE)).await?;
        let generation = catalog.get_generation().await?.map(Generation).unwrap_or(Generation(0));

        let frontend = Arc::new(Frontend::new(backend, catalog, &config));
        frontend.rebuild_catalog_from_backend().await?;

        let generation_counter = types::GenerationCounter::new(generation.0);
        let start_generation = generation_counter.skip_ahead();
        frontend.catalog().set_generation(start_generation.0).await?;

        let (slog, replay_records) = slog::Slog::open(&config.cache_dir.join(SLOG_FILE), TransId(1)).await?;
        let start_transid = slog.base_transid();

        if let Some(max_recorded) = frontend.catalog().max_trans_id().await? {
            if start_transid.0 > max_recorded.0 + 1 {
                return Err(CloudFileError::Integrity(format!(
                    "slog base transid {} is ahead of the newest transaction the catalog has ever recorded ({})",
                    start_transid.0, max_recorded.0
                )));
            }
        }

        let cache = Cache::new(Arc::clone(&frontend), config.clone(), start_transid, start_generation);
        let volume = Volume::new(
            Arc::clone(&cache),
            Arc::clone(&fine_bitmap),
            Arc::clone(&big_bitmap),
            Arc::clone(&old_big_bitmap),
            slog,
            size,
            config.clone(),
        );

        if !replay_records.is_empty() {
            tracing::info!(count = replay_records.len(), "replaying slog records from prior crash");
            for record in replay_records {
                if record.offset >= 0 {
                    volume.write(record.offset as u64, &record.payload).await?;
                }
            }
        }

        let interlocks = Arc::new(Interlocks::new());
        let collector_cancel = Arc::new(tokio::sync::Notify::new());
        let collector = Collector::new(Arc::clone(&frontend), Arc::clone(&interlocks), config.clone());
        let cancel_for_task = Arc::clone(&collector_cancel);
        tokio::spawn(async move {
            collector.run(cancel_for_task).await;
        });

        Ok(Self {
            volume,
            cache,
            frontend,
            fine_bitmap,
            big_bitmap,
            old_big_bitmap,
            cache_dir: config.cache_dir,
            collector_cancel,
            interlocks,
        })
    }

    async fn read_or_init_size(cache_dir: &Utf8PathBuf) -> Result<u64> {
        let path = cache_dir.join(CLOUDFILE_SIZE_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.len() == 8 => Ok(u64::from_le_bytes(bytes.try_into().unwrap())),
            Ok(_) | Err(_) => {
                tokio::fs::write(&path, 0u64.to_le_bytes()).await.map_err(CloudFileError::CacheIo)?;
                Ok(0)
            }
        }
    }

    async fn persist_size(&self, size: u64) -> Result<()> {
        tokio::fs::write(self.cache_dir.join(CLOUDFILE_SIZE_FILE), size.to_le_bytes())
            .await
            .map_err(CloudFileError::CacheIo)
    }

    pub async fn read(&self, pos: u64, len: u64) -> Result<Vec<u8>> {
        self.volume.read(pos, len).await
    }

    pub async fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.volume.write(pos, data).await
    }

    pub async fn punch_hole(&self, pos: u64, len: u64) -> Result<()> {
        self.volume.punch_hole(pos, len).await
    }

    pub async fn resize(&self, new_size: u64) -> Result<()> {
        self.volume.resize(new_size).await?;
        self.persist_size(new_size).await
    }

    pub fn size(&self) -> u64 {
        self.volume.size()
    }

    pub fn current_transid(&self) -> TransId {
        self.cache.current_transid()
    }

    pub fn generation(&self) -> Generation {
        self.cache.current_generation()
    }

    /// Enumerates every object currently on the backend. Used by tests
    /// and operational tooling; never on the hot path.
    pub async fn list(&self) -> Result<Vec<cloudfile_backend::ListedObject>> {
        self.frontend.list().await
    }

    /// Runs the atomic checkpoint sequence: submit dirty entries, sync
    /// the backend, flush the three bitmaps, and advance the transaction
    /// id (spec.md §4.3). `Volume` owns the live slog, so the call is
    /// routed through it rather than duplicating slog ownership here.
    pub async fn checkpoint(&self, do_submit: bool, retry_n: u32) -> Result<TransId> {
        self.volume
            .checkpoint_with_cache(&self.cache, retry_n, do_submit, [&self.fine_bitmap, &self.big_bitmap, &self.old_big_bitmap])
            .await
    }

    /// Gracefully stops the background collector. Does not flush
    /// anything outstanding -- call [`CloudFile::checkpoint`] first.
    pub async fn close(self) {
        self.collector_cancel.notify_waiters();
    }

    pub fn interlocks(&self) -> &Arc<Interlocks> {
        &self.interlocks
    }
}
