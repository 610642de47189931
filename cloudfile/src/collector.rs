//! Background collector (spec.md §4.5): a single worker loop draining a
//! persistent task queue (`tasks` table in the catalog), deleting
//! superseded and torn-down objects without blocking the client path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::CloudFileConfig;
use crate::error::Result;
use crate::frontend::catalog::{Catalog, TaskRow};
use crate::frontend::key::object_name;
use crate::frontend::Frontend;
use crate::types::{BlockKey, TransId};
use cloudfile_backend::Backend;

pub const TASK_REMOVE_OLD_OBJECTS: &str = "TASK_REMOVE_OLD_OBJECTS";
pub const TASK_REMOVE_TRANSACTION: &str = "TASK_REMOVE_TRANSACTION";

/// External pause interlocks (spec.md §4.5): scrub (read-integrity walk)
/// and mirror sync both need the catalog to hold still while they
/// enumerate, so the collector honors a raised pause and signals back
/// when its in-flight batch has drained.
pub struct Interlocks {
    scrub_paused: AtomicBool,
    mirror_paused: AtomicBool,
    batch_idle: Notify,
    resume: Notify,
}

impl Default for Interlocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Interlocks {
    pub fn new() -> Self {
        Self {
            scrub_paused: AtomicBool::new(false),
            mirror_paused: AtomicBool::new(false),
            batch_idle: Notify::new(),
            resume: Notify::new(),
        }
    }

    pub fn pause_for_scrub(&self) {
        self.scrub_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_after_scrub(&self) {
        self.scrub_paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    pub fn pause_for_mirror(&self) {
        self.mirror_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_after_mirror(&self) {
        self.mirror_paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    fn is_paused(&self) -> bool {
        self.scrub_paused.load(Ordering::SeqCst) || self.mirror_paused.load(Ordering::SeqCst)
    }

    /// Called by a scrub/mirror caller right after raising its pause, so
    /// it waits for any batch that was already in flight.
    pub async fn wait_for_batch_idle(&self) {
        self.batch_idle.notified().await;
    }
}

pub struct Collector {
    frontend: Arc<Frontend>,
    interlocks: Arc<Interlocks>,
    config: CloudFileConfig,
}

impl Collector {
    pub fn new(frontend: Arc<Frontend>, interlocks: Arc<Interlocks>, config: CloudFileConfig) -> Self {
        Self {
            frontend,
            interlocks,
            config,
        }
    }

    fn catalog(&self) -> &Catalog {
        self.frontend.catalog()
    }

    /// Runs the worker loop until cancelled. Never called from the
    /// client path; intended to be spawned once per mount.
    pub async fn run(&self, cancel: Arc<Notify>) {
        loop {
            if self.interlocks.is_paused() {
                self.interlocks.batch_idle.notify_waiters();
                tokio::select! {
                    _ = self.interlocks.resume.notified() => continue,
                    _ = cancel.notified() => return,
                }
            }

            match self.drain_one_batch().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = cancel.notified() => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "collector batch failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_base) => {}
                        _ = cancel.notified() => return,
                    }
                }
            }
        }
    }

    /// Pulls pending tasks, coalesces same-kind `TASK_REMOVE_OLD_OBJECTS`
    /// entries for the same cd into one multi-trans-delete, and executes
    /// them. Returns `true` if it did any work (so the caller loops
    /// immediately instead of sleeping).
    async fn drain_one_batch(&self) -> Result<bool> {
        let pending = self.catalog().pending_tasks().await?;
        if pending.is_empty() {
            return Ok(false);
        }

        let (remove_old, rest): (Vec<TaskRow>, Vec<TaskRow>) =
            pending.into_iter().partition(|t| t.task_id == TASK_REMOVE_OLD_OBJECTS);

        if !remove_old.is_empty() {
            self.run_remove_old_objects_batch(&remove_old).await?;
        }

        for task in rest {
            match task.task_id.as_str() {
                TASK_REMOVE_TRANSACTION => self.run_remove_transaction(&task).await?,
                other => tracing::warn!(task_id = other, "unknown task kind, dropping"),
            }
            self.catalog().complete_task(task.id).await?;
        }

        Ok(true)
    }

    /// Coalesces every `TASK_REMOVE_OLD_OBJECTS(T)` task for the same cd
    /// into a single backend bulk-delete pass (spec.md §4.5).
    async fn run_remove_old_objects_batch(&self, tasks: &[TaskRow]) -> Result<()> {
        use std::collections::HashMap;
        let mut by_cd: HashMap<Option<u64>, Vec<&TaskRow>> = HashMap::new();
        for t in tasks {
            by_cd.entry(t.cd_id).or_default().push(t);
        }

        for (cd_id, group) in by_cd {
            let upto = group.iter().map(|t| t.trans_id).max().unwrap_or(TransId(0));
            let superseded = self.catalog().superseded_versions(cd_id, upto).await?;
            if !superseded.is_empty() {
                let keys: Vec<_> = superseded
                    .iter()
                    .filter_map(|row| block_key_from_tkey(&row.tkey).map(|b| (row.trans_id, b)))
                    .collect();
                let names: Vec<_> = keys
                    .iter()
                    .map(|(trans_id, block)| object_name(cd_id, *trans_id, *block, self.config.prefix_shard))
                    .collect();
                self.frontend_del_raw(&names).await?;

                // Rows are per-transaction, so remove each at its own trans_id.
                for row in &superseded {
                    self.catalog().remove_objects(cd_id, &[row.tkey.clone()], row.trans_id).await?;
                }
            }
            for t in group {
                self.catalog().complete_task(t.id).await?;
            }
        }
        Ok(())
    }

    async fn run_remove_transaction(&self, task: &TaskRow) -> Result<()> {
        let rows = self.catalog().versions_in_transaction(task.cd_id, task.trans_id).await?;
        let names: Vec<_> = rows
            .iter()
            .filter_map(|row| block_key_from_tkey(&row.tkey).map(|b| object_name(task.cd_id, task.trans_id, b, self.config.prefix_shard)))
            .collect();
        self.frontend_del_raw(&names).await?;

        for marker in [
            crate::frontend::key::finalized_marker(task.cd_id, task.trans_id),
            crate::frontend::key::complete_marker(task.cd_id, task.trans_id),
            crate::frontend::key::inactive_marker(task.cd_id, task.trans_id),
        ] {
            self.frontend_del_raw(&[marker]).await?;
        }

        self.catalog().remove_transaction_rows(task.cd_id, task.trans_id).await?;
        Ok(())
    }

    async fn frontend_del_raw(&self, names: &[cloudfile_backend::BackendKey]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.frontend.backend_for_collector().del(names, None, true).await?;
        Ok(())
    }
}

fn block_key_from_tkey(tkey: &[u8]) -> Option<BlockKey> {
    let (&tag, rest) = tkey.split_first()?;
    let tier = match tag {
        b'b' => crate::types::Tier::Big,
        b's' => crate::types::Tier::Small,
        _ => return None,
    };
    let block_no = match rest.len() {
        1 => rest[0] as u64,
        2 => u16::from_be_bytes(rest.try_into().ok()?) as u64,
        4 => u32::from_be_bytes(rest.try_into().ok()?) as u64,
        8 => u64::from_be_bytes(rest.try_into().ok()?),
        _ => return None,
    };
    Some(BlockKey::new(tier, block_no))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::key::block_tkey;
    use crate::types::Tier;

    #[test]
    fn block_key_from_tkey_roundtrips_through_block_tkey() {
        let original = BlockKey::new(Tier::Small, 300);
        let tkey = block_tkey(original);
        let recovered = block_key_from_tkey(&tkey).unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn interlocks_report_paused_from_either_source() {
        let locks = Interlocks::new();
        assert!(!locks.is_paused());
        locks.pause_for_scrub();
        assert!(locks.is_paused());
        locks.resume_after_scrub();
        assert!(!locks.is_paused());
    }
}
