//! Transactional cache (spec.md §4.3): the volume layer's only path to
//! the frontend/backend. Holds resident block data, tracks dirty/clean/
//! submitted lifecycle, and runs the atomic checkpoint sequence.

pub mod entry;
pub mod eviction;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock as AsyncRwLock};

use crate::bitmap::BitmapStore;
use crate::config::CloudFileConfig;
use crate::error::{CloudFileError, Result};
use crate::frontend::Frontend;
use crate::slog::Slog;
use crate::types::{BlockKey, Generation, GenerationCounter, TransId};
use crate::waitmap::{Claim, WaitMap};
use cloudfile_backend::{GetFlags, PutFlags};

pub use entry::{BitmapInfo, CacheFlags, CacheEntry, EntryTag, Lifecycle};
use eviction::{sweep, ClockList, EvictOutcome};

struct CacheState {
    entries: HashMap<BlockKey, CacheEntry>,
    clock: ClockList<BlockKey>,
    used_bytes: u64,
    dirty_bytes: u64,
    submitted_bytes: u64,
    pending_deletes: Vec<BlockKey>,
}

/// Free-space watchdog band, evaluated against the configured budget
/// minus `used_bytes` (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceBand {
    Normal,
    Throttle,
    Critical,
    Min,
}

/// Slowdown applied to one admission attempt while the cache sits in the
/// `Throttle` band (spec.md §4.3: "throttle slows admissions").
const ADMISSION_THROTTLE_DELAY: Duration = Duration::from_millis(20);

pub struct Cache {
    state: AsyncMutex<CacheState>,
    wait_map: WaitMap<BlockKey>,
    put_barrier: AsyncRwLock<()>,
    space_available: Notify,
    frontend: Arc<Frontend>,
    config: CloudFileConfig,
    transid: AtomicU64,
    generation: GenerationCounter,
}

impl Cache {
    pub fn new(frontend: Arc<Frontend>, config: CloudFileConfig, start_transid: TransId, start_generation: Generation) -> Arc<Self> {
        Arc::new(Self {
            state: AsyncMutex::new(CacheState {
                entries: HashMap::new(),
                clock: ClockList::new(),
                used_bytes: 0,
                dirty_bytes: 0,
                submitted_bytes: 0,
                pending_deletes: Vec::new(),
            }),
            wait_map: WaitMap::new(),
            put_barrier: AsyncRwLock::new(()),
            space_available: Notify::new(),
            frontend,
            config,
            transid: AtomicU64::new(start_transid.0),
            generation: GenerationCounter::new(start_generation.0),
        })
    }

    pub fn current_transid(&self) -> TransId {
        TransId(self.transid.load(Ordering::SeqCst))
    }

    pub fn current_generation(&self) -> Generation {
        self.generation.current()
    }

    fn space_band(&self, state: &CacheState) -> SpaceBand {
        let remaining = self.config.cache_size_bytes.saturating_sub(state.used_bytes);
        if remaining <= self.config.min_free_bytes {
            SpaceBand::Min
        } else if remaining <= self.config.critical_free_bytes {
            SpaceBand::Critical
        } else if remaining <= self.config.throttle_free_bytes {
            SpaceBand::Throttle
        } else {
            SpaceBand::Normal
        }
    }

    /// Returns a referenced cache entry's bytes, fetching from the
    /// backend on a miss. Guarantees at most one concurrent fetch per key
    /// (spec.md §4.3) via [`WaitMap`]; a second caller suspends and then
    /// observes the entry the first caller populated.
    pub async fn get(
        &self,
        key: BlockKey,
        bitmap_info: BitmapInfo,
        flags: CacheFlags,
        size_hint: usize,
        tag: EntryTag,
    ) -> Result<Vec<u8>> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.refcount += 1;
                    entry.touch();
                    return Ok(entry.data.clone());
                }
            }

            match self.wait_map.claim(&key) {
                Claim::Follower(rx) => {
                    let _ = rx.await;
                    continue;
                }
                Claim::Leader => {
                    let result = self.populate(key, bitmap_info, flags, size_hint, tag).await;
                    self.wait_map.finish(&key);
                    return result;
                }
            }
        }
    }

    async fn populate(
        &self,
        key: BlockKey,
        bitmap_info: BitmapInfo,
        flags: CacheFlags,
        size_hint: usize,
        tag: EntryTag,
    ) -> Result<Vec<u8>> {
        let entry = if bitmap_info == BitmapInfo::NotPresent {
            CacheEntry::new_empty(size_hint, bitmap_info, tag, flags)
        } else {
            let mut data = Vec::new();
            let get_flags = if flags.contains(CacheFlags::PRIORITIZE_READ) {
                GetFlags::PRIORITIZE
            } else {
                GetFlags::empty()
            };
            let outcome = self
                .frontend
                .get(key, self.current_transid(), get_flags, &mut data)
                .await?;
            if !outcome.found {
                data = vec![0u8; size_hint];
            }
            CacheEntry::with_data(data, bitmap_info, tag, flags)
        };

        self.admit(key, entry, flags.contains(CacheFlags::DISABLE_THROTTLING)).await
    }

    async fn admit(&self, key: BlockKey, mut entry: CacheEntry, disable_throttling: bool) -> Result<Vec<u8>> {
        let incoming_size = entry.size_on_disk;
        let is_metadata = entry.tag == EntryTag::Metadata;
        loop {
            if !disable_throttling {
                match self.space_band_now().await {
                    // Critical refuses new admissions except metadata
                    // (spec.md §4.3): keep trying to evict/wait instead of
                    // ever reaching the insert below for a data entry.
                    SpaceBand::Critical if !is_metadata => {
                        let reclaimed = self.try_evict(incoming_size).await;
                        if reclaimed == 0 {
                            self.space_available.notified().await;
                        }
                        continue;
                    }
                    SpaceBand::Throttle => {
                        tokio::time::sleep(ADMISSION_THROTTLE_DELAY).await;
                    }
                    _ => {}
                }
            }

            {
                let mut state = self.state.lock().await;
                let would_be = state.used_bytes + incoming_size;
                let fits = would_be <= self.config.cache_size_bytes;
                if fits || disable_throttling {
                    entry.refcount += 1;
                    let data = entry.data.clone();
                    state.used_bytes += incoming_size;
                    state.clock.push_back(key);
                    state.entries.insert(key, entry);
                    return Ok(data);
                }
            }

            let reclaimed = self.try_evict(incoming_size).await;
            if reclaimed == 0 {
                if self.space_band_now().await == SpaceBand::Min {
                    return Err(CloudFileError::SpaceExhausted);
                }
                self.space_available.notified().await;
            }
        }
    }

    async fn space_band_now(&self) -> SpaceBand {
        let state = self.state.lock().await;
        self.space_band(&state)
    }

    async fn try_evict(&self, target_bytes: u64) -> u64 {
        let mut state = self.state.lock().await;
        let CacheState { entries, clock, used_bytes, .. } = &mut *state;
        let reclaimed = sweep(clock, target_bytes, |key| match entries.get_mut(key) {
            Some(e) if e.is_evictable() => {
                if e.tag == EntryTag::Metadata && e.second_chances > 0 {
                    e.second_chances -= 1;
                    EvictOutcome::Reprieved
                } else {
                    let size = e.size_on_disk;
                    entries.remove(key);
                    EvictOutcome::Evicted(size)
                }
            }
            Some(_) => EvictOutcome::Skip,
            None => EvictOutcome::Skip,
        });
        *used_bytes = used_bytes.saturating_sub(reclaimed);
        reclaimed
    }

    /// Decrements the reference count; does not itself trigger eviction.
    pub async fn release(&self, key: BlockKey) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(&key) {
            if entry.refcount > 0 {
                entry.refcount -= 1;
            }
        }
        drop(state);
        self.space_available.notify_waiters();
    }

    /// Writes `data` into the resident entry and marks it dirty. The
    /// caller must already hold a reference via [`Cache::get`].
    pub async fn write(&self, key: BlockKey, data: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().await;
        let was_dirty;
        let delta;
        {
            let entry = state
                .entries
                .get_mut(&key)
                .ok_or(CloudFileError::Invariant("write to a key not resident in cache"))?;
            was_dirty = entry.lifecycle == Lifecycle::Dirty;
            let old_len = entry.data.len() as u64;
            entry.data = data;
            entry.bitmap_info = BitmapInfo::Present;
            entry.lifecycle = Lifecycle::Dirty;
            entry.touch();
            delta = entry.data.len() as u64 as i64 - old_len as i64;
            entry.size_on_disk = entry.data.len() as u64;
        }
        if !was_dirty {
            state.dirty_bytes += state.entries[&key].size_on_disk;
        } else if delta != 0 {
            state.dirty_bytes = (state.dirty_bytes as i64 + delta).max(0) as u64;
        }
        Ok(())
    }

    /// Marks `key` for logical deletion: removed from cache, scheduled
    /// for an eventual backend delete at the next checkpoint.
    pub async fn del(&self, key: BlockKey) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.remove(&key) {
            state.used_bytes = state.used_bytes.saturating_sub(entry.size_on_disk);
            if entry.lifecycle == Lifecycle::Dirty {
                state.dirty_bytes = state.dirty_bytes.saturating_sub(entry.size_on_disk);
            }
            state.clock.remove(&key);
        }
        state.pending_deletes.push(key);
    }

    pub async fn dirty_all(&self) {
        let mut state = self.state.lock().await;
        let keys: Vec<BlockKey> = state.entries.keys().copied().collect();
        for key in keys {
            if let Some(entry) = state.entries.get_mut(&key) {
                if entry.lifecycle == Lifecycle::Clean {
                    entry.lifecycle = Lifecycle::Dirty;
                    state.dirty_bytes += entry.size_on_disk;
                }
            }
        }
    }

    pub async fn has_item_cached(&self, key: BlockKey) -> bool {
        self.state.lock().await.entries.contains_key(&key)
    }

    pub async fn set_second_chances(&self, key: BlockKey, n: u32) {
        if let Some(entry) = self.state.lock().await.entries.get_mut(&key) {
            entry.second_chances = n;
        }
    }

    pub async fn get_dirty_bytes(&self) -> u64 {
        self.state.lock().await.dirty_bytes
    }

    pub async fn get_submitted_bytes(&self) -> u64 {
        self.state.lock().await.submitted_bytes
    }

    pub async fn cache_total_space(&self) -> u64 {
        self.config.cache_size_bytes
    }

    /// The atomic checkpoint sequence (spec.md §4.3). Idempotent: safe to
    /// call again if a prior attempt failed partway, since every step
    /// (puts, finalize markers, bitmap flush) is itself idempotent.
    pub async fn checkpoint(&self, do_submit: bool, retry_n: u32, bitmaps: [&BitmapStore; 3], slog: &mut Slog) -> Result<TransId> {
        let mut attempt = 0;
        loop {
            match self.checkpoint_once(do_submit, bitmaps, slog).await {
                Ok(new_transid) => return Ok(new_transid),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt > retry_n {
                        tracing::error!(error = %e, "checkpoint exhausted retries");
                        return Err(e);
                    }
                    let delay = std::cmp::min(
                        self.config.retry_base * 2u32.saturating_pow(attempt.min(20)),
                        self.config.retry_cap,
                    );
                    tracing::warn!(attempt, error = %e, "checkpoint failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn checkpoint_once(&self, do_submit: bool, bitmaps: [&BitmapStore; 3], slog: &mut Slog) -> Result<TransId> {
        // Step 1: exclude new put()s for the duration of the swap.
        let _barrier = self.put_barrier.write().await;

        let old_transid = self.current_transid();
        let generation = self.generation.current();

        if do_submit {
            self.submit_dirty_entries(old_transid, generation).await?;
            self.flush_pending_deletes(old_transid).await?;
        }

        // Step 2/3: this implementation fsyncs each slog record and
        // executes frontend puts inline, so there is no separate
        // unsynced-keys buffer or put-db worker queue left to drain.

        // Step 4: backend durability barrier.
        self.frontend.sync().await?;

        // Step 5: flush the three bitmap cache entries.
        for bm in bitmaps {
            bm.flush().await.map_err(CloudFileError::CacheIo)?;
        }

        // Step 6: advance transaction id, write the finalized marker. This
        // implementation has no external readers pinning an older transid
        // beyond what the catalog's own multi-version rows already serve,
        // so the transaction a checkpoint just finalized is immediately
        // eligible for cleanup -- `complete: true` enqueues
        // TASK_REMOVE_OLD_OBJECTS for it (and any still-incomplete
        // predecessor) right here rather than deferring to a separate
        // completion trigger.
        let new_transid = old_transid.next();
        self.generation.advance();
        self.frontend.transaction_finalize(old_transid, true).await?;
        self.frontend.new_transaction(new_transid).await?;
        self.transid.store(new_transid.0, Ordering::SeqCst);

        // Step 7: bitmaps are plain mutable files rather than per-
        // transaction objects in this implementation, so there is
        // nothing further to reopen; the flush in step 5 already left
        // them consistent for the new transaction.
        slog.rotate(new_transid).await?;

        self.transition_submitted_to_clean().await;
        Ok(new_transid)
    }

    async fn submit_dirty_entries(&self, transid: TransId, generation: Generation) -> Result<()> {
        let dirty_keys: Vec<BlockKey> = {
            let state = self.state.lock().await;
            state
                .entries
                .iter()
                .filter(|(_, e)| e.lifecycle == Lifecycle::Dirty)
                .map(|(k, _)| *k)
                .collect()
        };

        for key in dirty_keys {
            let data = {
                let mut state = self.state.lock().await;
                let Some(entry) = state.entries.get_mut(&key) else { continue };
                entry.lifecycle = Lifecycle::Submitted;
                entry.data.clone()
            };
            let size = self.frontend.put(key, transid, generation, &data, PutFlags::empty()).await?;
            let mut state = self.state.lock().await;
            state.dirty_bytes = state.dirty_bytes.saturating_sub(data.len() as u64);
            state.submitted_bytes += size;
        }
        Ok(())
    }

    async fn flush_pending_deletes(&self, transid: TransId) -> Result<()> {
        let pending = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.pending_deletes)
        };
        if !pending.is_empty() {
            self.frontend.del(&pending, transid).await?;
        }
        Ok(())
    }

    async fn transition_submitted_to_clean(&self) {
        let mut state = self.state.lock().await;
        let submitted = state.submitted_bytes;
        for entry in state.entries.values_mut() {
            if entry.lifecycle == Lifecycle::Submitted {
                entry.lifecycle = Lifecycle::Clean;
            }
        }
        state.submitted_bytes = 0;
        let _ = submitted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::Catalog;
    use crate::types::Tier;
    use cloudfile_backend::{AnyBackend, LocalDiskBackend};

    async fn new_cache() -> (Arc<Cache>, camino_tempfile::TempDir) {
        let dir = camino_tempfile::tempdir().unwrap();
        let backend = AnyBackend::local_disk(LocalDiskBackend::new(dir.path().join("objects")).await.unwrap());
        let catalog = Catalog::open_in_memory().await.unwrap();
        let mut config = CloudFileConfig::default();
        config.cache_size_bytes = 1 << 20;
        let frontend = Arc::new(Frontend::new(backend, catalog, &config));
        let cache = Cache::new(frontend, config, TransId(1), Generation(1));
        (cache, dir)
    }

    #[tokio::test]
    async fn get_on_not_present_returns_zero_fill() {
        let (cache, _dir) = new_cache().await;
        let key = BlockKey::new(Tier::Small, 1);
        let data = cache
            .get(key, BitmapInfo::NotPresent, CacheFlags::empty(), 4096, EntryTag::Data)
            .await
            .unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn write_then_read_back_without_checkpoint() {
        let (cache, _dir) = new_cache().await;
        let key = BlockKey::new(Tier::Small, 1);
        cache
            .get(key, BitmapInfo::NotPresent, CacheFlags::empty(), 4096, EntryTag::Data)
            .await
            .unwrap();
        cache.write(key, vec![7u8; 4096]).await.unwrap();
        assert_eq!(cache.get_dirty_bytes().await, 4096);

        let data = cache
            .get(key, BitmapInfo::Present, CacheFlags::empty(), 4096, EntryTag::Data)
            .await
            .unwrap();
        assert_eq!(data, vec![7u8; 4096]);
    }

    #[tokio::test]
    async fn del_schedules_pending_delete_and_drops_entry() {
        let (cache, _dir) = new_cache().await;
        let key = BlockKey::new(Tier::Small, 1);
        cache
            .get(key, BitmapInfo::NotPresent, CacheFlags::empty(), 4096, EntryTag::Data)
            .await
            .unwrap();
        cache.del(key).await;
        assert!(!cache.has_item_cached(key).await);
    }

    #[tokio::test]
    async fn metadata_tagged_entry_survives_an_eviction_pass_then_evicts() {
        let (cache, _dir) = new_cache().await;
        let key = BlockKey::new(Tier::Small, 1);
        cache
            .get(key, BitmapInfo::NotPresent, CacheFlags::empty(), 4096, EntryTag::Metadata)
            .await
            .unwrap();
        cache.release(key).await;
        cache.set_second_chances(key, 1).await;

        // First sweep: reprieved, still resident.
        let reclaimed = cache.try_evict(4096).await;
        assert_eq!(reclaimed, 0);
        assert!(cache.has_item_cached(key).await);

        // Second sweep: second-chance spent, now evictable.
        let reclaimed = cache.try_evict(4096).await;
        assert_eq!(reclaimed, 4096);
        assert!(!cache.has_item_cached(key).await);
    }

    #[tokio::test]
    async fn critical_band_admits_metadata_but_refuses_plain_data() {
        let dir = camino_tempfile::tempdir().unwrap();
        let backend = AnyBackend::local_disk(LocalDiskBackend::new(dir.path().join("objects")).await.unwrap());
        let catalog = Catalog::open_in_memory().await.unwrap();
        let mut config = CloudFileConfig::default();
        config.cache_size_bytes = 8192;
        config.critical_free_bytes = 8192;
        config.throttle_free_bytes = 8192;
        config.min_free_bytes = 0;
        let frontend = Arc::new(Frontend::new(backend, catalog, &config));
        let cache = Cache::new(frontend, config, TransId(1), Generation(1));

        // Cache starts empty, so `remaining == cache_size_bytes (8192) <=
        // critical_free_bytes (8192)`: already in the Critical band.
        assert_eq!(cache.space_band_now().await, SpaceBand::Critical);

        let metadata_key = BlockKey::new(Tier::Small, 1);
        let data = cache
            .get(metadata_key, BitmapInfo::NotPresent, CacheFlags::empty(), 4096, EntryTag::Metadata)
            .await
            .unwrap();
        assert_eq!(data.len(), 4096);
        assert!(cache.has_item_cached(metadata_key).await);
    }

    #[tokio::test]
    async fn second_claimant_waits_for_first_fetch_instead_of_duplicating() {
        let (cache, _dir) = new_cache().await;
        let key = BlockKey::new(Tier::Small, 1);
        let c1 = Arc::clone(&cache);
        let c2 = Arc::clone(&cache);
        let (a, b) = tokio::join!(
            c1.get(key, BitmapInfo::NotPresent, CacheFlags::empty(), 4096, EntryTag::Data),
            c2.get(key, BitmapInfo::NotPresent, CacheFlags::empty(), 4096, EntryTag::Data),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        // Exactly one entry admitted, not two independent fetches merged
        // into double refcount accounting gone wrong.
        assert!(cache.has_item_cached(key).await);
    }
}
