//! Invariant checks (spec.md §8) exercised against the public
//! `CloudFile` facade plus a couple of lower-level pieces that aren't
//! reachable from it (the at-most-one-fetch race needs direct `Cache`
//! access).

use std::sync::Arc;

use camino_tempfile::TempDir;
use cloudfile::config::CloudFileConfig;
use cloudfile::types::{BlockKey, Generation, Tier, TransId};
use cloudfile::CloudFile;
use cloudfile_backend::{AnyBackend, LocalDiskBackend};

async fn open(dir: &TempDir, size: u64) -> CloudFile {
    let backend = AnyBackend::local_disk(LocalDiskBackend::new(dir.path().join("objects")).await.unwrap());
    let config = CloudFileConfig {
        cache_dir: dir.path().join("cache"),
        ..Default::default()
    };
    let cf = CloudFile::open(backend, config).await.unwrap();
    cf.resize(size).await.unwrap();
    cf
}

#[tokio::test]
async fn round_trip_after_checkpoint() {
    let dir = camino_tempfile::tempdir().unwrap();
    let cf = open(&dir, 4 << 20).await;

    cf.write(0, &vec![1u8; 4096]).await.unwrap();
    cf.write(1 << 20, &vec![2u8; 4096]).await.unwrap();
    cf.checkpoint(true, 3).await.unwrap();

    assert_eq!(cf.read(0, 4096).await.unwrap(), vec![1u8; 4096]);
    assert_eq!(cf.read(1 << 20, 4096).await.unwrap(), vec![2u8; 4096]);
}

#[tokio::test]
async fn sparse_read_is_all_zero() {
    let dir = camino_tempfile::tempdir().unwrap();
    let cf = open(&dir, 4 << 20).await;
    let data = cf.read(2 << 20, 8192).await.unwrap();
    assert!(data.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn checkpoint_is_idempotent_in_observable_state() {
    let dir = camino_tempfile::tempdir().unwrap();
    let cf = open(&dir, 1 << 20).await;
    cf.write(0, &vec![5u8; 4096]).await.unwrap();
    cf.checkpoint(true, 3).await.unwrap();
    let after_first = cf.read(0, 4096).await.unwrap();

    cf.checkpoint(true, 3).await.unwrap();
    let after_second = cf.read(0, 4096).await.unwrap();

    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn transaction_id_is_non_decreasing_across_checkpoints() {
    let dir = camino_tempfile::tempdir().unwrap();
    let cf = open(&dir, 1 << 20).await;
    let before = cf.current_transid();
    cf.write(0, &vec![1u8; 4096]).await.unwrap();
    cf.checkpoint(true, 3).await.unwrap();
    let after = cf.current_transid();
    assert!(after >= before);
}

#[tokio::test]
async fn generation_strictly_increases_across_a_restart() {
    let dir = camino_tempfile::tempdir().unwrap();
    let first_gen = {
        let cf = open(&dir, 1 << 20).await;
        cf.generation()
    };

    let backend = AnyBackend::local_disk(LocalDiskBackend::new(dir.path().join("objects")).await.unwrap());
    let config = CloudFileConfig {
        cache_dir: dir.path().join("cache"),
        ..Default::default()
    };
    let second_gen = CloudFile::open(backend, config).await.unwrap().generation();

    assert!(second_gen > first_gen);
}

#[tokio::test]
async fn at_most_one_backend_fetch_services_concurrent_readers() {
    use cloudfile::cache::{BitmapInfo, Cache, CacheFlags, EntryTag};
    use cloudfile::frontend::{Catalog, Frontend};

    let dir = camino_tempfile::tempdir().unwrap();
    let backend = AnyBackend::local_disk(LocalDiskBackend::new(dir.path().join("objects")).await.unwrap());
    let catalog = Catalog::open_in_memory().await.unwrap();
    let config = CloudFileConfig::default();
    let frontend = Arc::new(Frontend::new(backend, catalog, &config));
    frontend
        .put(BlockKey::new(Tier::Small, 0), TransId(1), Generation(1), &[9u8; 4096], cloudfile_backend::PutFlags::empty())
        .await
        .unwrap();

    let cache = Cache::new(frontend, config, TransId(1), Generation(1));
    let key = BlockKey::new(Tier::Small, 0);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            cache.get(key, BitmapInfo::Present, CacheFlags::empty(), 4096, EntryTag::Data).await.unwrap()
        }));
    }
    let results: Vec<_> = futures::future::join_all(handles).await.into_iter().map(Result::unwrap).collect();
    for r in &results {
        assert_eq!(r, &vec![9u8; 4096]);
    }
    // `Cache::get` serializes concurrent misses for the same key through
    // `WaitMap`, so only one of these eight callers actually populated
    // the entry -- the rest observed it afterward. We can't directly
    // count backend calls from here, but a torn/duplicated populate
    // would show up as divergent data, which the assertion above rules
    // out.
    assert!(cache.has_item_cached(key).await);
}

#[tokio::test]
async fn bitmap_coherence_used_bits_match_written_cells() {
    use cloudfile::bitmap::BitmapStore;

    let dir = camino_tempfile::tempdir().unwrap();
    let bitmap = BitmapStore::open(&dir.path().join("bitmap"), 1024, 16).await.unwrap();
    bitmap.set_range(0, 10, true).await;
    bitmap.set(512, true).await;
    assert_eq!(bitmap.count_bits().await, 11);
}
