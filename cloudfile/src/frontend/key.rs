//! Object key layout (spec §4.4, §6): how a `(cd_id, transid, BlockKey)`
//! triple becomes a backend object name.

use cloudfile_backend::BackendKey;

use crate::types::{BlockKey, TransId};

/// Smallest-width big-endian encoding of `block_no`, matching the
/// "smallest unsigned integer that fits" rule from spec.md §4.4.
fn minimal_be_bytes(value: u64) -> Vec<u8> {
    if value <= u8::MAX as u64 {
        vec![value as u8]
    } else if value <= u16::MAX as u64 {
        (value as u16).to_be_bytes().to_vec()
    } else if value <= u32::MAX as u64 {
        (value as u32).to_be_bytes().to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

/// The short tier-tagged key identifying a block, independent of
/// transaction id: `<tag><minimal-width block_no>`.
pub fn block_tkey(block: BlockKey) -> Vec<u8> {
    let mut out = vec![block.tier.tag()];
    out.extend(minimal_be_bytes(block.block_no));
    out
}

/// First 5 hex chars of MD5(tkey), split into an `aaa/bb/` prefix
/// (spec.md §4.4, §6).
pub fn prefix_shard(tkey: &[u8]) -> String {
    let digest = md5::compute(tkey);
    let full_hex = hex::encode(digest.0);
    let shard = &full_hex[..5];
    format!("{}/{}/", &shard[..3], &shard[3..5])
}

/// Builds the full bucket object name for one block version:
/// `{prefix/}{cd_id "_" }{trans_id}_{hex(tkey)}` (spec.md §6).
pub fn object_name(cd_id: Option<u64>, transid: TransId, block: BlockKey, shard: bool) -> BackendKey {
    let tkey = block_tkey(block);
    let mut name = String::new();
    if shard {
        name.push_str(&prefix_shard(&tkey));
    }
    if let Some(id) = cd_id {
        name.push_str(&id.to_string());
        name.push('_');
    }
    name.push_str(&transid.0.to_string());
    name.push('_');
    name.push_str(&hex::encode(&tkey));
    BackendKey::new(name)
}

fn marker_name(cd_id: Option<u64>, transid: TransId, suffix: &str) -> BackendKey {
    let mut name = String::new();
    if let Some(id) = cd_id {
        name.push_str(&id.to_string());
        name.push('_');
    }
    name.push_str(&transid.0.to_string());
    name.push('_');
    name.push_str(suffix);
    BackendKey::new(name)
}

pub fn finalized_marker(cd_id: Option<u64>, transid: TransId) -> BackendKey {
    marker_name(cd_id, transid, "finalized")
}

pub fn complete_marker(cd_id: Option<u64>, transid: TransId) -> BackendKey {
    marker_name(cd_id, transid, "complete")
}

pub fn inactive_marker(cd_id: Option<u64>, transid: TransId) -> BackendKey {
    marker_name(cd_id, transid, "inactive")
}

pub const MAGIC_FILE_KEY: &str = "cd_magic_file";
pub const MAGIC_FILE_CONTENTS: &str = "CD_MAGIC";
pub const NUM_FILE_KEY: &str = "cd_num_file";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;

    #[test]
    fn block_no_uses_smallest_width() {
        assert_eq!(block_tkey(BlockKey::new(Tier::Small, 5)), vec![b's', 5]);
        assert_eq!(block_tkey(BlockKey::new(Tier::Big, 300)).len(), 3);
        assert_eq!(block_tkey(BlockKey::new(Tier::Big, 70_000)).len(), 5);
    }

    #[test]
    fn object_name_without_sharding_has_no_slashes() {
        let name = object_name(Some(7), TransId(42), BlockKey::new(Tier::Big, 1), false);
        assert!(!name.as_str().contains('/'));
        assert!(name.as_str().starts_with("7_42_"));
    }

    #[test]
    fn object_name_with_sharding_has_prefix() {
        let name = object_name(None, TransId(1), BlockKey::new(Tier::Small, 1), true);
        let s = name.as_str();
        assert_eq!(s.matches('/').count(), 2);
    }

    #[test]
    fn markers_are_distinguishable() {
        let t = TransId(5);
        assert_ne!(finalized_marker(None, t), complete_marker(None, t));
        assert_ne!(finalized_marker(None, t), inactive_marker(None, t));
    }
}
