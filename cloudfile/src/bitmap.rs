//! Persistent bit arrays with a page cache over a backing file (spec
//! §4.1). Three of these exist per mount: the fine bitmap (one bit per
//! 4 KiB cell), the big-block bitmap, and the old-big-block bitmap.
//! `BitmapStore` is the same type for all three; `Volume` owns three
//! instances plus an in-memory-only fourth (new-big-block) that is never
//! backed by a file.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::sync::Arc;

use camino::Utf8Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::waitmap::{Claim, WaitMap};

pub const PAGE_SIZE: usize = 4096;
const BITS_PER_PAGE: u64 = PAGE_SIZE as u64 * 8;

struct Page {
    data: [u8; PAGE_SIZE],
    dirty: bool,
}

impl Page {
    fn zeroed() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
            dirty: false,
        }
    }
}

struct Inner {
    file: File,
    pages: HashMap<u64, Page>,
    lru: VecDeque<u64>,
    len_bits: u64,
}

/// A durable bit array backed by `path`, with an LRU-bounded page cache.
///
/// Concurrency: callers are expected to hold the volume's extent lock (or
/// an equivalent serialization point) while calling `get`/`set`/ranged
/// operations, per spec §4.1 ("bitmap access is serialized by the
/// caller"). Page *fetches* still cooperate across concurrent callers via
/// [`WaitMap`], because a stalled fetch must not block unrelated pages.
pub struct BitmapStore {
    inner: AsyncMutex<Inner>,
    wait_map: WaitMap<u64>,
    max_resident_pages: usize,
    used_bits: std::sync::atomic::AtomicU64,
}

impl BitmapStore {
    pub async fn open(path: &Utf8Path, len_bits: u64, max_resident_pages: usize) -> std::io::Result<Self> {
        let needed_bytes = (len_bits.div_ceil(8)).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;
        let cur_len = file.metadata().await?.len();
        if cur_len < needed_bytes {
            file.set_len(needed_bytes).await?;
        }

        let store = Self {
            inner: AsyncMutex::new(Inner {
                file,
                pages: HashMap::new(),
                lru: VecDeque::new(),
                len_bits,
            }),
            wait_map: WaitMap::new(),
            max_resident_pages: max_resident_pages.max(1),
            used_bits: std::sync::atomic::AtomicU64::new(0),
        };
        Ok(store)
    }

    fn page_of(bit: u64) -> (u64, usize, u8) {
        let page = bit / BITS_PER_PAGE;
        let within = bit % BITS_PER_PAGE;
        let byte = (within / 8) as usize;
        let mask = 1u8 << (within % 8);
        (page, byte, mask)
    }

    /// Load `page_idx` into the cache, cooperating with any in-flight
    /// fetch for the same page via the wait-list.
    async fn fetch_page(&self, page_idx: u64) {
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.pages.contains_key(&page_idx) {
                    return;
                }
            }
            match self.wait_map.claim(&page_idx) {
                Claim::Follower(rx) => {
                    let _ = rx.await;
                    continue;
                }
                Claim::Leader => break,
            }
        }

        let mut buf = [0u8; PAGE_SIZE];
        {
            let mut inner = self.inner.lock().await;
            let offset = page_idx * PAGE_SIZE as u64;
            if inner.file.seek(SeekFrom::Start(offset)).await.is_ok() {
                let _ = inner.file.read_exact(&mut buf).await;
            }
            self.admit(&mut inner, page_idx, Page { data: buf, dirty: false }).await;
        }
        self.wait_map.finish(&page_idx);
    }

    async fn admit(&self, inner: &mut Inner, page_idx: u64, page: Page) {
        while inner.pages.len() >= self.max_resident_pages {
            let Some(victim) = inner.lru.pop_front() else {
                break;
            };
            if let Some(p) = inner.pages.remove(&victim) {
                if p.dirty {
                    Self::writeback(&mut inner.file, victim, &p.data).await;
                }
            }
        }
        inner.pages.insert(page_idx, page);
        inner.lru.push_back(page_idx);
    }

    async fn writeback(file: &mut File, page_idx: u64, data: &[u8; PAGE_SIZE]) {
        let offset = page_idx * PAGE_SIZE as u64;
        for attempt in 0..5 {
            if file.seek(SeekFrom::Start(offset)).await.is_ok() && file.write_all(data).await.is_ok() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50 * (attempt + 1))).await;
        }
        tracing::error!(page_idx, "bitmap page writeback failed after retries");
    }

    pub async fn get(&self, bit: u64) -> bool {
        let (page_idx, byte, mask) = Self::page_of(bit);
        self.fetch_page(page_idx).await;
        let inner = self.inner.lock().await;
        inner
            .pages
            .get(&page_idx)
            .map(|p| p.data[byte] & mask != 0)
            .unwrap_or(false)
    }

    pub async fn set(&self, bit: u64, value: bool) {
        let (page_idx, byte, mask) = Self::page_of(bit);
        self.fetch_page(page_idx).await;
        let mut inner = self.inner.lock().await;
        if let Some(p) = inner.pages.get_mut(&page_idx) {
            let was = p.data[byte] & mask != 0;
            if was != value {
                if value {
                    p.data[byte] |= mask;
                    self.used_bits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                } else {
                    p.data[byte] &= !mask;
                    self.used_bits.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                }
                p.dirty = true;
            }
        }
    }

    /// True iff any bit in `[start, end)` is set. Skips whole all-zero
    /// bytes (spec §4.1).
    pub async fn get_range(&self, start: u64, end: u64) -> bool {
        let mut bit = start;
        while bit < end {
            let (page_idx, byte, _) = Self::page_of(bit);
            self.fetch_page(page_idx).await;
            let inner = self.inner.lock().await;
            let page_bit_start = page_idx * BITS_PER_PAGE;
            if let Some(p) = inner.pages.get(&page_idx) {
                // Fast-skip whole zero bytes within this page.
                if p.data[byte] != 0 {
                    let byte_bit_start = page_bit_start + (byte as u64) * 8;
                    for b in 0..8 {
                        let candidate = byte_bit_start + b;
                        if candidate < start || candidate >= end {
                            continue;
                        }
                        if p.data[byte] & (1 << b) != 0 {
                            return true;
                        }
                    }
                }
            }
            bit += 1;
        }
        false
    }

    /// Sets every bit in `[start, end)` to `value`, returning how many
    /// bits actually changed (spec §4.1, for `used_bytes` bookkeeping).
    pub async fn set_range(&self, start: u64, end: u64, value: bool) -> u64 {
        let mut changed = 0;
        let mut bit = start;
        while bit < end {
            let (page_idx, byte, mask) = Self::page_of(bit);
            self.fetch_page(page_idx).await;
            let mut inner = self.inner.lock().await;
            if let Some(p) = inner.pages.get_mut(&page_idx) {
                let was = p.data[byte] & mask != 0;
                if was != value {
                    if value {
                        p.data[byte] |= mask;
                    } else {
                        p.data[byte] &= !mask;
                    }
                    p.dirty = true;
                    changed += 1;
                }
            }
            bit += 1;
        }
        if value {
            self.used_bits.fetch_add(changed, std::sync::atomic::Ordering::Relaxed);
        } else {
            self.used_bits.fetch_sub(changed, std::sync::atomic::Ordering::Relaxed);
        }
        changed
    }

    /// Total set bits, used once at open to initialize `used_bytes`.
    /// Skips whole bytes that are 0 or 0xFF.
    pub async fn count_bits(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        let total_pages = inner.len_bits.div_ceil(BITS_PER_PAGE);
        let mut count = 0u64;
        for page_idx in 0..total_pages {
            drop(inner);
            self.fetch_page(page_idx).await;
            inner = self.inner.lock().await;
            if let Some(p) = inner.pages.get(&page_idx) {
                for &byte in p.data.iter() {
                    if byte == 0 || byte == 0xFF {
                        count += (byte == 0xFF) as u64 * 8;
                        continue;
                    }
                    count += byte.count_ones() as u64;
                }
            }
        }
        self.used_bits.store(count, std::sync::atomic::Ordering::Relaxed);
        count
    }

    pub fn used_bits_hint(&self) -> u64 {
        self.used_bits.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Writes all dirty pages back. Idempotent.
    pub async fn flush(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock().await;
        let page_indices: Vec<u64> = inner.pages.iter().filter(|(_, p)| p.dirty).map(|(&k, _)| k).collect();
        for idx in page_indices {
            let data = inner.pages.get(&idx).unwrap().data;
            Self::writeback(&mut inner.file, idx, &data).await;
            if let Some(p) = inner.pages.get_mut(&idx) {
                p.dirty = false;
            }
        }
        inner.file.flush().await?;
        inner.file.sync_all().await?;
        Ok(())
    }

    /// Grows the logical bitmap to cover `new_len_bits`, zero-filling the
    /// new tail (used by `Volume::resize`, spec §4.6).
    pub async fn extend(&self, new_len_bits: u64) -> std::io::Result<()> {
        let mut inner = self.inner.lock().await;
        if new_len_bits <= inner.len_bits {
            inner.len_bits = new_len_bits;
            return Ok(());
        }
        let needed_bytes = (new_len_bits.div_ceil(8)).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        let cur_len = inner.file.metadata().await?.len();
        if cur_len < needed_bytes {
            inner.file.set_len(needed_bytes).await?;
        }
        inner.len_bits = new_len_bits;
        Ok(())
    }
}

pub type SharedBitmap = Arc<BitmapStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_roundtrip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = BitmapStore::open(&dir.path().join("bm"), 1 << 20, 4).await.unwrap();
        assert!(!store.get(100).await);
        store.set(100, true).await;
        assert!(store.get(100).await);
        assert!(!store.get(101).await);
    }

    #[tokio::test]
    async fn range_scan_skips_zero_bytes() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = BitmapStore::open(&dir.path().join("bm"), 1 << 20, 4).await.unwrap();
        assert!(!store.get_range(0, 10_000).await);
        store.set(9_999, true).await;
        assert!(store.get_range(0, 10_000).await);
        assert!(!store.get_range(0, 9_999).await);
    }

    #[tokio::test]
    async fn set_range_reports_bits_changed() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = BitmapStore::open(&dir.path().join("bm"), 1 << 20, 4).await.unwrap();
        let changed = store.set_range(0, 20, true).await;
        assert_eq!(changed, 20);
        let changed_again = store.set_range(0, 20, true).await;
        assert_eq!(changed_again, 0);
    }

    #[tokio::test]
    async fn flush_persists_across_reopen() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("bm");
        {
            let store = BitmapStore::open(&path, 1 << 20, 2).await.unwrap();
            store.set(42, true).await;
            store.flush().await.unwrap();
        }
        let reopened = BitmapStore::open(&path, 1 << 20, 2).await.unwrap();
        assert!(reopened.get(42).await);
    }

    #[tokio::test]
    async fn count_bits_matches_manual_sets() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = BitmapStore::open(&dir.path().join("bm"), 1 << 16, 8).await.unwrap();
        for bit in [1, 2, 500, 501, 8192] {
            store.set(bit, true).await;
        }
        assert_eq!(store.count_bits().await, 5);
    }
}
