//! Volume layer (spec.md §4.6): the logical byte-addressable view over
//! the transactional cache. Decides which tier (big/small block) covers
//! each byte range, routes through `cache.get`/`cache.write`, and runs
//! the big-block fracture process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::Mutex as AsyncMutex;

use crate::bitmap::BitmapStore;
use crate::cache::{BitmapInfo, Cache, CacheFlags, EntryTag};
use crate::config::CloudFileConfig;
use crate::error::{CloudFileError, Result};
use crate::extent_lock::ExtentLockTable;
use crate::slog::Slog;
use crate::types::{BlockKey, Tier, CELL_SIZE};

pub struct Volume {
    cache: Arc<Cache>,
    fine_bitmap: Arc<BitmapStore>,
    big_bitmap: Arc<BitmapStore>,
    old_big_bitmap: Arc<BitmapStore>,
    new_big_bitmap: AsyncMutex<HashSet<u64>>,
    extent_locks: Arc<ExtentLockTable>,
    slog: AsyncMutex<Slog>,
    size_bytes: AtomicU64,
    config: CloudFileConfig,
    active_big_block: AtomicU64,
    fracturing: AsyncMutex<HashSet<u64>>,
    read_only: AtomicBool,
    self_weak: OnceLock<Weak<Volume>>,
}

impl Volume {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<Cache>,
        fine_bitmap: Arc<BitmapStore>,
        big_bitmap: Arc<BitmapStore>,
        old_big_bitmap: Arc<BitmapStore>,
        slog: Slog,
        size_bytes: u64,
        config: CloudFileConfig,
    ) -> Arc<Self> {
        let volume = Arc::new(Self {
            cache,
            fine_bitmap,
            big_bitmap,
            old_big_bitmap,
            new_big_bitmap: AsyncMutex::new(HashSet::new()),
            extent_locks: ExtentLockTable::new(),
            slog: AsyncMutex::new(slog),
            size_bytes: AtomicU64::new(size_bytes),
            config,
            active_big_block: AtomicU64::new(u64::MAX),
            fracturing: AsyncMutex::new(HashSet::new()),
            read_only: AtomicBool::new(false),
            self_weak: OnceLock::new(),
        });
        let _ = volume.self_weak.set(Arc::downgrade(&volume));
        volume
    }

    /// True once a checkpoint has failed and no later one has yet
    /// succeeded (spec.md §4.3: the mount goes read-only until a
    /// successful retry).
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> u64 {
        self.size_bytes.load(Ordering::SeqCst)
    }

    fn cell_index(pos: u64) -> u64 {
        pos / CELL_SIZE
    }

    fn big_block_no(pos: u64) -> u64 {
        pos / Tier::Big.block_size()
    }

    async fn tier_for(&self, pos: u64) -> Tier {
        let big_no = Self::big_block_no(pos);
        if self.big_bitmap.get(big_no).await {
            Tier::Big
        } else {
            Tier::Small
        }
    }

    /// Reads `len` bytes starting at `pos`. Sparse regions (fine-bitmap
    /// clear, or entirely past EOF) are returned as zero-fill without
    /// touching the cache.
    pub async fn read(&self, pos: u64, len: u64) -> Result<Vec<u8>> {
        let _guard = self.extent_locks.lock_shared(pos, pos + len).await;
        let size = self.size();
        let mut out = vec![0u8; len as usize];
        if pos >= size {
            return Ok(out);
        }
        let effective_len = len.min(size.saturating_sub(pos));

        let mut done = 0u64;
        while done < effective_len {
            let cur = pos + done;
            let tier = self.tier_for(cur).await;
            let block = BlockKey::covering(tier, cur);
            let block_off = cur - block.start();
            let chunk = (block.end() - cur).min(effective_len - done);

            let first_cell = Self::cell_index(cur);
            let last_cell = Self::cell_index(cur + chunk - 1);
            let has_data = self.fine_bitmap.get_range(first_cell, last_cell + 1).await;
            if has_data {
                let data = self
                    .cache
                    .get(block, BitmapInfo::Unknown, CacheFlags::empty(), tier.block_size() as usize, EntryTag::Data)
                    .await?;
                let avail = data.len() as u64 - block_off;
                let take = chunk.min(avail);
                out[done as usize..(done + take) as usize]
                    .copy_from_slice(&data[block_off as usize..(block_off + take) as usize]);
                self.cache.release(block).await;
            }
            done += chunk;
        }
        Ok(out)
    }

    /// Writes `data` at `pos`. Appends a slog record before the write is
    /// considered acknowledged, then routes each covered block through
    /// the cache, marking fine-bits and accruing `used_bytes`.
    pub async fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        if self.is_read_only() {
            return Err(CloudFileError::ReadOnly);
        }
        let len = data.len() as u64;
        let _guard = self.extent_locks.lock_shared(pos, pos + len).await;

        {
            let mut slog = self.slog.lock().await;
            slog.append(pos as i64, data).await?;
        }

        let mut done = 0u64;
        while done < len {
            let cur = pos + done;
            let tier = self.tier_for(cur).await;
            let block = BlockKey::covering(tier, cur);
            let block_off = cur - block.start();
            let chunk = (block.end() - cur).min(len - done);

            let first_cell = Self::cell_index(cur);
            let last_cell = Self::cell_index(cur + chunk - 1);
            let has_data = self.fine_bitmap.get_range(first_cell, last_cell + 1).await;
            let bitmap_info = if has_data { BitmapInfo::Present } else { BitmapInfo::NotPresent };

            let mut existing = self
                .cache
                .get(block, bitmap_info, CacheFlags::empty(), tier.block_size() as usize, EntryTag::Data)
                .await?;
            existing[block_off as usize..(block_off + chunk) as usize]
                .copy_from_slice(&data[done as usize..(done + chunk) as usize]);
            self.cache.write(block, existing).await?;
            self.cache.release(block).await;

            let changed = self.fine_bitmap.set_range(first_cell, last_cell + 1, true).await;
            let _ = changed; // used_bytes bookkeeping is owned by the bitmap store itself.

            self.maybe_schedule_fracture(block).await;
            done += chunk;
        }

        let mut slog = self.slog.lock().await;
        if slog.needs_rotation(self.config.slog_max_size) {
            tracing::info!("slog reached max size, checkpoint required");
        }
        Ok(())
    }

    /// Big-block-neighbor fracture heuristic (spec.md §4.6): a write more
    /// than one big-block away from the current active big block, against
    /// a big block that was already present before this transaction
    /// (old-big-bitmap set), becomes fracture-eligible after a delay.
    async fn maybe_schedule_fracture(&self, written: BlockKey) {
        if written.tier != Tier::Big {
            return;
        }
        let active = self.active_big_block.swap(written.block_no, Ordering::SeqCst);
        if active == u64::MAX {
            return;
        }
        let distance = written.block_no.abs_diff(active);
        if distance <= 1 {
            return;
        }
        if !self.old_big_bitmap.get(written.block_no).await {
            return;
        }

        let mut fracturing = self.fracturing.lock().await;
        if !fracturing.insert(written.block_no) {
            return;
        }
        drop(fracturing);

        tracing::debug!(big_block = written.block_no, "scheduling fracture");
        let Some(weak) = self.self_weak.get().cloned() else {
            return;
        };
        let delay = self.config.fracture_delay;
        let big_block_no = written.block_no;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(volume) = weak.upgrade() else { return };
            if let Err(e) = volume.fracture(big_block_no).await {
                tracing::warn!(big_block_no, error = %e, "scheduled fracture failed");
            }
        });
    }

    /// Executes a fracture of `big_block_no`: rewrites every still-live
    /// small-block subrange as independent small-block objects, then
    /// drops the old big-block bit.
    pub async fn fracture(&self, big_block_no: u64) -> Result<()> {
        let start = big_block_no * Tier::Big.block_size();
        let end = start + Tier::Big.block_size();
        let _guard = self.extent_locks.lock_exclusive(start, end).await;

        self.big_bitmap.set(big_block_no, false).await;

        let small_per_big = Tier::Big.block_size() / Tier::Small.block_size();
        let first_small = start / Tier::Small.block_size();
        for i in 0..small_per_big {
            let small_block_no = first_small + i;
            let small_start = small_block_no * Tier::Small.block_size();
            let first_cell = Self::cell_index(small_start);
            let last_cell = Self::cell_index(small_start + Tier::Small.block_size() - 1);
            if !self.fine_bitmap.get_range(first_cell, last_cell + 1).await {
                continue;
            }

            let read_result = self.read(small_start, Tier::Small.block_size()).await;
            match read_result {
                Ok(bytes) => {
                    if let Err(e) = self.write(small_start, &bytes).await {
                        tracing::warn!(small_block_no, error = %e, "fracture rewrite failed, restoring big bit");
                        self.big_bitmap.set(big_block_no, true).await;
                        self.fracturing.lock().await.remove(&big_block_no);
                        return Err(e);
                    }
                }
                Err(e) => {
                    tracing::warn!(small_block_no, error = %e, "fracture read failed, restoring big bit");
                    self.big_bitmap.set(big_block_no, true).await;
                    self.fracturing.lock().await.remove(&big_block_no);
                    return Err(e);
                }
            }
        }

        self.old_big_bitmap.set(big_block_no, false).await;
        self.fracturing.lock().await.remove(&big_block_no);
        Ok(())
    }

    /// Zero-fills `[pos, pos+len)`. When an entire block becomes empty it
    /// is dropped from the cache; if every small block inside a big block
    /// is then empty, the big-block bit is restored so the next write
    /// uses the big tier again.
    pub async fn punch_hole(&self, pos: u64, len: u64) -> Result<()> {
        if self.is_read_only() {
            return Err(CloudFileError::ReadOnly);
        }
        let _guard = self.extent_locks.lock_exclusive(pos, pos + len).await;

        let mut done = 0u64;
        while done < len {
            let cur = pos + done;
            let tier = self.tier_for(cur).await;
            let block = BlockKey::covering(tier, cur);
            let block_off = cur - block.start();
            let chunk = (block.end() - cur).min(len - done);

            let first_cell = Self::cell_index(cur);
            let last_cell = Self::cell_index(cur + chunk - 1);
            self.fine_bitmap.set_range(first_cell, last_cell + 1, false).await;

            let block_start_cell = Self::cell_index(block.start());
            let block_end_cell = Self::cell_index(block.end() - 1);
            let block_now_empty = !self.fine_bitmap.get_range(block_start_cell, block_end_cell + 1).await;
            if block_now_empty {
                if block_off == 0 && chunk >= tier.block_size() {
                    self.cache.del(block).await;
                }
                self.consider_big_block_restore(block).await;
            }

            done += chunk;
        }
        Ok(())
    }

    async fn consider_big_block_restore(&self, small_block: BlockKey) {
        if small_block.tier != Tier::Small {
            return;
        }
        let big_no = small_block.start() / Tier::Big.block_size();
        let small_per_big = Tier::Big.block_size() / Tier::Small.block_size();
        let first_small = big_no * small_per_big;
        let start_cell = Self::cell_index(first_small * Tier::Small.block_size());
        let end_cell = Self::cell_index((first_small + small_per_big) * Tier::Small.block_size() - 1);
        let any_data = self.fine_bitmap.get_range(start_cell, end_cell + 1).await;
        if !any_data {
            self.big_bitmap.set(big_no, true).await;
        }
    }

    /// Runs the cache's atomic checkpoint sequence using this volume's
    /// live slog and bitmaps (spec.md §4.3). The only mutable access to
    /// the slog in the whole mount goes through this method, so a
    /// checkpoint and a concurrent write can never race on rotation.
    pub async fn checkpoint_with_cache(&self, cache: &Arc<Cache>, retry_n: u32, do_submit: bool, bitmaps: [&BitmapStore; 3]) -> Result<crate::types::TransId> {
        let mut slog = self.slog.lock().await;
        match cache.checkpoint(do_submit, retry_n, bitmaps, &mut slog).await {
            Ok(transid) => {
                self.read_only.store(false, Ordering::SeqCst);
                Ok(transid)
            }
            Err(e) => {
                tracing::error!(error = %e, "checkpoint failed, mount going read-only until the next successful checkpoint");
                self.read_only.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Resizes the volume, extending/zero-filling the bitmaps as needed.
    pub async fn resize(&self, new_size: u64) -> Result<()> {
        let old_size = self.size();
        let _guard = self.extent_locks.lock_exclusive(0, old_size.max(new_size)).await;

        let new_cells = new_size.div_ceil(CELL_SIZE);
        let new_big_blocks = new_size.div_ceil(Tier::Big.block_size());
        self.fine_bitmap.extend(new_cells).await.map_err(crate::error::CloudFileError::CacheIo)?;
        self.big_bitmap.extend(new_big_blocks).await.map_err(crate::error::CloudFileError::CacheIo)?;
        self.old_big_bitmap.extend(new_big_blocks).await.map_err(crate::error::CloudFileError::CacheIo)?;

        self.size_bytes.store(new_size, Ordering::SeqCst);
        Ok(())
    }
}
