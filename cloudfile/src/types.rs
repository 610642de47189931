//! Primary entities (spec §3): blocks, transactions, generations.

use std::sync::atomic::{AtomicU64, Ordering};

pub const CELL_SIZE: u64 = 4096;
pub const BIG_BLOCK_SIZE: u64 = 20 * 1024 * 1024;
pub const SMALL_BLOCK_SIZE: u64 = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Big,
    Small,
}

impl Tier {
    pub fn block_size(self) -> u64 {
        match self {
            Tier::Big => BIG_BLOCK_SIZE,
            Tier::Small => SMALL_BLOCK_SIZE,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Tier::Big => b'b',
            Tier::Small => b's',
        }
    }
}

/// Identifies one block-sized slice of the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub tier: Tier,
    pub block_no: u64,
}

impl BlockKey {
    pub fn new(tier: Tier, block_no: u64) -> Self {
        Self { tier, block_no }
    }

    pub fn covering(tier: Tier, byte_offset: u64) -> Self {
        Self::new(tier, byte_offset / tier.block_size())
    }

    pub fn start(&self) -> u64 {
        self.block_no * self.tier.block_size()
    }

    pub fn end(&self) -> u64 {
        self.start() + self.tier.block_size()
    }
}

/// Monotone transaction id (spec §3, Transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransId(pub u64);

impl TransId {
    pub const MAX: TransId = TransId(u64::MAX);

    pub fn next(self) -> Self {
        TransId(self.0 + 1)
    }
}

impl std::fmt::Display for TransId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone 64-bit generation counter (spec §3, Generation). Persisted
/// with a skip-ahead of at least 100 on open so a lost increment never
/// lets a stale reader believe it's current (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

pub const GENERATION_SKIP_AHEAD: u64 = 100;

#[derive(Debug, Default)]
pub struct GenerationCounter(AtomicU64);

impl GenerationCounter {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn current(&self) -> Generation {
        Generation(self.0.load(Ordering::SeqCst))
    }

    pub fn advance(&self) -> Generation {
        Generation(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Called once at open: bump past whatever was persisted, in case
    /// the previous process crashed between incrementing and persisting.
    pub fn skip_ahead(&self) -> Generation {
        Generation(
            self.0
                .fetch_add(GENERATION_SKIP_AHEAD, Ordering::SeqCst)
                + GENERATION_SKIP_AHEAD,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_key_covers_the_right_offset() {
        let k = BlockKey::covering(Tier::Big, BIG_BLOCK_SIZE + 5);
        assert_eq!(k.block_no, 1);
        assert_eq!(k.start(), BIG_BLOCK_SIZE);
        assert_eq!(k.end(), 2 * BIG_BLOCK_SIZE);
    }

    #[test]
    fn generation_is_monotone_across_skip_ahead() {
        let counter = GenerationCounter::new(41);
        let first = counter.advance();
        assert_eq!(first, Generation(42));
        let after_restart = GenerationCounter::new(first.0);
        let second = after_restart.skip_ahead();
        assert!(second > first);
    }
}
