//! Transaction lifecycle (spec.md §4.4 "Transaction semantics"):
//! `new_transaction`, `transaction_finalize`, `set_active_transactions`.

use cloudfile_backend::{AnyBackend, Backend, PutFlags};

use crate::error::Result;
use crate::frontend::catalog::Catalog;
use crate::frontend::key::{complete_marker, finalized_marker, inactive_marker};
use crate::types::TransId;

async fn put_empty_marker(backend: &AnyBackend, key: cloudfile_backend::BackendKey) -> Result<()> {
    let mut empty: &[u8] = &[];
    backend.put(&key, &mut empty, PutFlags::empty()).await?;
    Ok(())
}

/// Allocates the next transaction id and records it as active in the
/// catalog. Callers then write through the new id until they checkpoint.
pub async fn new_transaction(catalog: &Catalog, next_id: TransId) -> Result<TransId> {
    catalog.upsert_transaction(next_id, false, true).await?;
    Ok(next_id)
}

/// `complete=false`: writes `<T>_finalized`, a barrier meaning no further
/// puts will land in `T`. `complete=true`: additionally writes
/// `<T>_complete` and enqueues `TASK_REMOVE_OLD_OBJECTS` for `T` and every
/// finalized predecessor (spec.md §4.4).
pub async fn transaction_finalize(
    catalog: &Catalog,
    backend: &AnyBackend,
    cd_id: Option<u64>,
    trans_id: TransId,
    complete: bool,
) -> Result<()> {
    put_empty_marker(backend, finalized_marker(cd_id, trans_id)).await?;
    catalog.upsert_transaction(trans_id, complete, true).await?;

    if complete {
        put_empty_marker(backend, complete_marker(cd_id, trans_id)).await?;
        catalog
            .enqueue_task("TASK_REMOVE_OLD_OBJECTS", trans_id, cd_id, now_secs())
            .await?;
        for predecessor in catalog.incomplete_transactions().await? {
            if predecessor < trans_id {
                catalog
                    .enqueue_task("TASK_REMOVE_OLD_OBJECTS", predecessor, cd_id, now_secs())
                    .await?;
            }
        }
    }
    Ok(())
}

/// Writes `<T>_inactive` for every incomplete transaction not present in
/// `active`, and schedules `TASK_REMOVE_TRANSACTION` for each (spec.md
/// §4.4).
pub async fn set_active_transactions(
    catalog: &Catalog,
    backend: &AnyBackend,
    cd_id: Option<u64>,
    active: &[TransId],
) -> Result<()> {
    let incomplete = catalog.incomplete_transactions().await?;
    for trans_id in incomplete {
        if active.contains(&trans_id) {
            continue;
        }
        put_empty_marker(backend, inactive_marker(cd_id, trans_id)).await?;
        catalog
            .enqueue_task("TASK_REMOVE_TRANSACTION", trans_id, cd_id, now_secs())
            .await?;
    }
    Ok(())
}

/// Test tooling can't call `std::time::SystemTime::now()` indirectly
/// through a workflow-evaluated path, but normal runtime code can; this
/// indirection exists so task timestamps have one call site.
fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudfile_backend::{AnyBackend, LocalDiskBackend};

    async fn backend() -> (AnyBackend, camino_tempfile::TempDir) {
        let dir = camino_tempfile::tempdir().unwrap();
        let inner = LocalDiskBackend::new(dir.path().to_owned()).await.unwrap();
        (AnyBackend::local_disk(inner), dir)
    }

    #[tokio::test]
    async fn finalize_without_complete_writes_only_finalized_marker() {
        let (backend, _dir) = backend().await;
        let catalog = Catalog::open_in_memory().await.unwrap();
        new_transaction(&catalog, TransId(1)).await.unwrap();
        transaction_finalize(&catalog, &backend, None, TransId(1), false).await.unwrap();

        let listed = backend.list().await.unwrap();
        assert!(listed.iter().any(|o| o.key.as_str().ends_with("_finalized")));
        assert!(!listed.iter().any(|o| o.key.as_str().ends_with("_complete")));
    }

    #[tokio::test]
    async fn finalize_with_complete_enqueues_cleanup_task() {
        let (backend, _dir) = backend().await;
        let catalog = Catalog::open_in_memory().await.unwrap();
        new_transaction(&catalog, TransId(1)).await.unwrap();
        transaction_finalize(&catalog, &backend, None, TransId(1), true).await.unwrap();

        let pending = catalog.pending_tasks().await.unwrap();
        assert!(pending.iter().any(|t| t.task_id == "TASK_REMOVE_OLD_OBJECTS" && t.trans_id == TransId(1)));
    }

    #[tokio::test]
    async fn set_active_transactions_marks_dropped_ones_inactive() {
        let (backend, _dir) = backend().await;
        let catalog = Catalog::open_in_memory().await.unwrap();
        new_transaction(&catalog, TransId(1)).await.unwrap();
        new_transaction(&catalog, TransId(2)).await.unwrap();

        set_active_transactions(&catalog, &backend, None, &[TransId(2)]).await.unwrap();

        let listed = backend.list().await.unwrap();
        assert!(listed.iter().any(|o| o.key.as_str() == "1_inactive"));
        let pending = catalog.pending_tasks().await.unwrap();
        assert!(pending.iter().any(|t| t.task_id == "TASK_REMOVE_TRANSACTION" && t.trans_id == TransId(1)));
    }
}
