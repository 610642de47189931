//! Local embedded-SQL catalog (spec.md §4.4, §6): tracks every object
//! version, transaction, and pending background task without requiring a
//! backend `list()` on the common path. Schema matches spec.md §6
//! literally.
//!
//! `rusqlite` (bundled) is used rather than a hand-rolled format, per
//! spec.md §4.4's explicit "local embedded SQL database" language.

use std::path::Path;

use camino::Utf8Path;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{CloudFileError, Result};
use crate::types::TransId;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clouddrive_objects (
    cd_id           INTEGER,
    trans_id        INTEGER NOT NULL,
    tkey            BLOB NOT NULL,
    md5sum          TEXT NOT NULL,
    size            INTEGER NOT NULL,
    last_modified   INTEGER,
    mirrored        INTEGER NOT NULL DEFAULT 0,
    deleted         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (cd_id, trans_id, tkey)
);
CREATE INDEX IF NOT EXISTS idx_objects_tkey ON clouddrive_objects(cd_id, tkey, trans_id);

CREATE TABLE IF NOT EXISTS clouddrive_transactions (
    id          INTEGER PRIMARY KEY,
    completed   INTEGER NOT NULL DEFAULT 0,
    active      INTEGER NOT NULL DEFAULT 1,
    mirrored    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     TEXT NOT NULL,
    trans_id    INTEGER NOT NULL,
    cd_id       INTEGER,
    created     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS clouddrive_generation (
    generation  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS misc (
    key     TEXT PRIMARY KEY,
    value   TEXT NOT NULL
);
";

#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub cd_id: Option<u64>,
    pub trans_id: TransId,
    pub tkey: Vec<u8>,
    pub md5sum: String,
    pub size: u64,
    pub last_modified: Option<i64>,
    pub mirrored: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub task_id: String,
    pub trans_id: TransId,
    pub cd_id: Option<u64>,
    pub created: i64,
}

/// Wraps a single `rusqlite::Connection` behind an async mutex; all calls
/// are `spawn_blocking`-free here since sqlite calls are fast local I/O,
/// matching how the teacher treats its local metadata stores (short,
/// synchronous critical sections under an async lock rather than a
/// dedicated blocking pool).
pub struct Catalog {
    conn: AsyncMutex<Connection>,
}

impl Catalog {
    pub async fn open(path: &Utf8Path) -> Result<Self> {
        let path = path.to_owned();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(path.as_std_path())?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|_| CloudFileError::Invariant("catalog open task panicked"))?
        .map_err(|e| CloudFileError::CacheIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        Ok(Self {
            conn: AsyncMutex::new(conn),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CloudFileError::CacheIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CloudFileError::CacheIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(Self {
            conn: AsyncMutex::new(conn),
        })
    }

    pub async fn is_empty(&self) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM clouddrive_objects", [], |r| r.get(0))
            .map_err(sqlite_err)?;
        Ok(count == 0)
    }

    pub async fn insert_object(&self, row: &ObjectRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO clouddrive_objects
                (cd_id, trans_id, tkey, md5sum, size, last_modified, mirrored, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.cd_id.map(|v| v as i64),
                row.trans_id.0 as i64,
                row.tkey,
                row.md5sum,
                row.size as i64,
                row.last_modified,
                row.mirrored as i64,
                row.deleted as i64,
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Newest non-deleted version of `tkey` with `trans_id <= at`.
    pub async fn newest_version(&self, cd_id: Option<u64>, tkey: &[u8], at: TransId) -> Result<Option<ObjectRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT cd_id, trans_id, tkey, md5sum, size, last_modified, mirrored, deleted
                 FROM clouddrive_objects
                 WHERE (cd_id IS ?1 OR (?1 IS NULL AND cd_id IS NULL))
                   AND tkey = ?2 AND trans_id <= ?3
                 ORDER BY trans_id DESC LIMIT 1",
                params![cd_id.map(|v| v as i64), tkey, at.0 as i64],
                Self::row_to_object,
            )
            .optional()
            .map_err(sqlite_err)?;
        Ok(row)
    }

    pub async fn mark_deleted(&self, cd_id: Option<u64>, trans_id: TransId, tkey: &[u8]) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO clouddrive_objects
                (cd_id, trans_id, tkey, md5sum, size, last_modified, mirrored, deleted)
             VALUES (?1, ?2, ?3, '', 0, NULL, 0, 1)",
            params![cd_id.map(|v| v as i64), trans_id.0 as i64, tkey],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Every version older than `upto` with a strictly newer successor at
    /// or before `upto` -- the candidate set for `TASK_REMOVE_OLD_OBJECTS`
    /// (spec.md §4.5).
    pub async fn superseded_versions(&self, cd_id: Option<u64>, upto: TransId) -> Result<Vec<ObjectRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT a.cd_id, a.trans_id, a.tkey, a.md5sum, a.size, a.last_modified, a.mirrored, a.deleted
                 FROM clouddrive_objects a
                 WHERE (a.cd_id IS ?1 OR (?1 IS NULL AND a.cd_id IS NULL))
                   AND a.trans_id <= ?2
                   AND EXISTS (
                       SELECT 1 FROM clouddrive_objects b
                       WHERE b.tkey = a.tkey
                         AND (b.cd_id IS a.cd_id OR (a.cd_id IS NULL AND b.cd_id IS NULL))
                         AND b.trans_id > a.trans_id AND b.trans_id <= ?2
                   )",
            )
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![cd_id.map(|v| v as i64), upto.0 as i64], Self::row_to_object)
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }

    pub async fn versions_in_transaction(&self, cd_id: Option<u64>, trans_id: TransId) -> Result<Vec<ObjectRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT cd_id, trans_id, tkey, md5sum, size, last_modified, mirrored, deleted
                 FROM clouddrive_objects
                 WHERE (cd_id IS ?1 OR (?1 IS NULL AND cd_id IS NULL)) AND trans_id = ?2",
            )
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![cd_id.map(|v| v as i64), trans_id.0 as i64], Self::row_to_object)
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }

    pub async fn remove_objects(&self, cd_id: Option<u64>, tkeys: &[Vec<u8>], trans_id: TransId) -> Result<()> {
        let conn = self.conn.lock().await;
        for tkey in tkeys {
            conn.execute(
                "DELETE FROM clouddrive_objects
                 WHERE (cd_id IS ?1 OR (?1 IS NULL AND cd_id IS NULL)) AND tkey = ?2 AND trans_id = ?3",
                params![cd_id.map(|v| v as i64), tkey, trans_id.0 as i64],
            )
            .map_err(sqlite_err)?;
        }
        Ok(())
    }

    pub async fn remove_transaction_rows(&self, cd_id: Option<u64>, trans_id: TransId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM clouddrive_objects WHERE (cd_id IS ?1 OR (?1 IS NULL AND cd_id IS NULL)) AND trans_id = ?2",
            params![cd_id.map(|v| v as i64), trans_id.0 as i64],
        )
        .map_err(sqlite_err)?;
        conn.execute("DELETE FROM clouddrive_transactions WHERE id = ?1", params![trans_id.0 as i64])
            .map_err(sqlite_err)?;
        Ok(())
    }

    pub async fn upsert_transaction(&self, trans_id: TransId, completed: bool, active: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO clouddrive_transactions (id, completed, active, mirrored)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT(id) DO UPDATE SET completed = excluded.completed, active = excluded.active",
            params![trans_id.0 as i64, completed as i64, active as i64],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Highest transaction id the catalog has ever recorded, or `None` on
    /// a fresh/empty catalog. Used at mount time to sanity-check the slog
    /// against the catalog (spec.md §6).
    pub async fn max_trans_id(&self) -> Result<Option<TransId>> {
        let conn = self.conn.lock().await;
        let v: Option<i64> = conn
            .query_row("SELECT MAX(id) FROM clouddrive_transactions", [], |r| r.get(0))
            .map_err(sqlite_err)?;
        Ok(v.map(|v| TransId(v as u64)))
    }

    pub async fn incomplete_transactions(&self) -> Result<Vec<TransId>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id FROM clouddrive_transactions WHERE completed = 0")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], |r| r.get::<_, i64>(0))
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows.into_iter().map(|v| TransId(v as u64)).collect())
    }

    pub async fn enqueue_task(&self, task_id: &str, trans_id: TransId, cd_id: Option<u64>, created: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (task_id, trans_id, cd_id, created) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, trans_id.0 as i64, cd_id.map(|v| v as i64), created],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    pub async fn pending_tasks(&self) -> Result<Vec<TaskRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, task_id, trans_id, cd_id, created FROM tasks ORDER BY id ASC")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], |r| {
                Ok(TaskRow {
                    id: r.get(0)?,
                    task_id: r.get(1)?,
                    trans_id: TransId(r.get::<_, i64>(2)? as u64),
                    cd_id: r.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                    created: r.get(4)?,
                })
            })
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }

    pub async fn complete_task(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id]).map_err(sqlite_err)?;
        Ok(())
    }

    pub async fn get_generation(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock().await;
        let v: Option<i64> = conn
            .query_row("SELECT generation FROM clouddrive_generation LIMIT 1", [], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?;
        Ok(v.map(|v| v as u64))
    }

    pub async fn set_generation(&self, generation: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM clouddrive_generation", []).map_err(sqlite_err)?;
        conn.execute("INSERT INTO clouddrive_generation (generation) VALUES (?1)", params![generation as i64])
            .map_err(sqlite_err)?;
        Ok(())
    }

    pub async fn get_misc(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let v = conn
            .query_row("SELECT value FROM misc WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?;
        Ok(v)
    }

    pub async fn set_misc(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO misc (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    fn row_to_object(r: &rusqlite::Row) -> rusqlite::Result<ObjectRow> {
        Ok(ObjectRow {
            cd_id: r.get::<_, Option<i64>>(0)?.map(|v| v as u64),
            trans_id: TransId(r.get::<_, i64>(1)? as u64),
            tkey: r.get(2)?,
            md5sum: r.get(3)?,
            size: r.get::<_, i64>(4)? as u64,
            last_modified: r.get(5)?,
            mirrored: r.get::<_, i64>(6)? != 0,
            deleted: r.get::<_, i64>(7)? != 0,
        })
    }
}

fn sqlite_err(e: rusqlite::Error) -> CloudFileError {
    CloudFileError::CacheIo(std::io::Error::new(std::io::ErrorKind::Other, e))
}

#[allow(dead_code)]
fn _assert_path_usable(_p: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_query_newest_version() {
        let cat = Catalog::open_in_memory().await.unwrap();
        cat.insert_object(&ObjectRow {
            cd_id: None,
            trans_id: TransId(1),
            tkey: vec![b's', 1],
            md5sum: "abc".into(),
            size: 4096,
            last_modified: None,
            mirrored: false,
            deleted: false,
        })
        .await
        .unwrap();
        cat.insert_object(&ObjectRow {
            cd_id: None,
            trans_id: TransId(3),
            tkey: vec![b's', 1],
            md5sum: "def".into(),
            size: 4096,
            last_modified: None,
            mirrored: false,
            deleted: false,
        })
        .await
        .unwrap();

        let at2 = cat.newest_version(None, &[b's', 1], TransId(2)).await.unwrap().unwrap();
        assert_eq!(at2.md5sum, "abc");
        let at5 = cat.newest_version(None, &[b's', 1], TransId(5)).await.unwrap().unwrap();
        assert_eq!(at5.md5sum, "def");
    }

    #[tokio::test]
    async fn superseded_versions_finds_only_overwritten_rows() {
        let cat = Catalog::open_in_memory().await.unwrap();
        for (trans, key) in [(1u64, vec![1u8]), (2, vec![1u8]), (1, vec![2u8])] {
            cat.insert_object(&ObjectRow {
                cd_id: None,
                trans_id: TransId(trans),
                tkey: key,
                md5sum: "x".into(),
                size: 1,
                last_modified: None,
                mirrored: false,
                deleted: false,
            })
            .await
            .unwrap();
        }
        let superseded = cat.superseded_versions(None, TransId(5)).await.unwrap();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].trans_id, TransId(1));
        assert_eq!(superseded[0].tkey, vec![1u8]);
    }

    #[tokio::test]
    async fn generation_roundtrips() {
        let cat = Catalog::open_in_memory().await.unwrap();
        assert_eq!(cat.get_generation().await.unwrap(), None);
        cat.set_generation(42).await.unwrap();
        assert_eq!(cat.get_generation().await.unwrap(), Some(42));
        cat.set_generation(100).await.unwrap();
        assert_eq!(cat.get_generation().await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn max_trans_id_is_none_until_a_transaction_is_recorded() {
        let cat = Catalog::open_in_memory().await.unwrap();
        assert_eq!(cat.max_trans_id().await.unwrap(), None);
        cat.upsert_transaction(TransId(1), true, false).await.unwrap();
        cat.upsert_transaction(TransId(3), false, true).await.unwrap();
        assert_eq!(cat.max_trans_id().await.unwrap(), Some(TransId(3)));
    }

    #[tokio::test]
    async fn task_queue_enqueue_and_complete() {
        let cat = Catalog::open_in_memory().await.unwrap();
        cat.enqueue_task("TASK_REMOVE_OLD_OBJECTS", TransId(1), None, 1000).await.unwrap();
        let pending = cat.pending_tasks().await.unwrap();
        assert_eq!(pending.len(), 1);
        cat.complete_task(pending[0].id).await.unwrap();
        assert!(cat.pending_tasks().await.unwrap().is_empty());
    }
}
