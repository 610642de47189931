//! Cache entry data model (spec.md §4.3).

use std::time::Instant;

bitflags::bitflags! {
    /// Per-entry hints threaded through from the volume layer's `get`
    /// call (spec.md §4.3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        const READ_ONLY           = 1 << 0;
        const SEQUENTIAL_HINT     = 1 << 1;
        const DISABLE_MEMFILES    = 1 << 2;
        const DISABLE_THROTTLING  = 1 << 3;
        const PRIORITIZE_READ     = 1 << 4;
        const PRELOAD_ONCE        = 1 << 5;
        const DISABLE_FD_CACHE    = 1 << 6;
    }
}

/// Whether a persisted object exists for this key in the current
/// transaction, from the caller's point of view at `get` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapInfo {
    Unknown,
    Present,
    NotPresent,
}

/// Marks entries the frontend/volume layer considers structural
/// (bitmap pages, catalog-adjacent metadata) rather than user data. These
/// get extra second-chances on eviction (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTag {
    Data,
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Clean,
    Dirty,
    Submitted,
}

pub struct CacheEntry {
    pub data: Vec<u8>,
    pub size_on_disk: u64,
    pub bitmap_info: BitmapInfo,
    pub lifecycle: Lifecycle,
    pub refcount: u32,
    pub last_used: Instant,
    pub tag: EntryTag,
    pub flags: CacheFlags,
    pub second_chances: u32,
}

impl CacheEntry {
    pub fn new_empty(size_hint: usize, bitmap_info: BitmapInfo, tag: EntryTag, flags: CacheFlags) -> Self {
        Self {
            data: vec![0u8; size_hint],
            size_on_disk: size_hint as u64,
            bitmap_info,
            lifecycle: Lifecycle::Clean,
            refcount: 0,
            last_used: Instant::now(),
            tag,
            flags,
            second_chances: 0,
        }
    }

    pub fn with_data(data: Vec<u8>, bitmap_info: BitmapInfo, tag: EntryTag, flags: CacheFlags) -> Self {
        let size_on_disk = data.len() as u64;
        Self {
            data,
            size_on_disk,
            bitmap_info,
            lifecycle: Lifecycle::Clean,
            refcount: 0,
            last_used: Instant::now(),
            tag,
            flags,
            second_chances: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn is_evictable(&self) -> bool {
        self.refcount == 0 && self.lifecycle != Lifecycle::Dirty
    }
}
