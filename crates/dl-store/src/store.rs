use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use dl_common::RowRange;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::grouping_key;

/// SQLite-backed query log: a write buffer drained into an append-only archive,
/// plus the persistent domain filter table.
pub struct LogStore {
    conn: Arc<Mutex<Connection>>,
}

/// One raw query as it sits in the write buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedQuery {
    pub ts: i64,
    pub fqdn: String,
    pub blocked: bool,
}

impl BufferedQuery {
    pub fn new(fqdn: impl Into<String>, blocked: bool) -> Self {
        Self {
            ts: dl_common::now_ts(),
            fqdn: fqdn.into(),
            blocked,
        }
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS query_buffer (
        ts INTEGER NOT NULL,
        fqdn TEXT NOT NULL,
        blocked INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS query_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        fqdn TEXT NOT NULL,
        domain TEXT NOT NULL,
        blocked INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS domain_filter (
        domain TEXT PRIMARY KEY,
        options INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_log_ts ON query_log(ts);
    CREATE INDEX IF NOT EXISTS idx_log_domain ON query_log(domain);
    CREATE INDEX IF NOT EXISTS idx_log_fqdn ON query_log(fqdn);
";

impl LogStore {
    /// Open (or create) the database at `path`, enable WAL mode and create
    /// the schema. Failing to create the schema is fatal for the caller.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open query log DB at {}", path))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self::init(conn)?;
        info!("Query log store opened at {}", path);
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create query log tables")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Queue a query in the write buffer, stamped with the current time.
    pub fn append(&self, fqdn: &str, blocked: bool) -> Result<()> {
        self.append_at(fqdn, blocked, dl_common::now_ts())
    }

    pub fn append_at(&self, fqdn: &str, blocked: bool, ts: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO query_buffer (ts, fqdn, blocked) VALUES (?1, ?2, ?3)",
            rusqlite::params![ts, fqdn, blocked as i32],
        )?;
        Ok(())
    }

    /// Insert a batch of queries into the write buffer in a single transaction.
    pub fn append_batch(&self, queries: &[BufferedQuery]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO query_buffer (ts, fqdn, blocked) VALUES (?1, ?2, ?3)",
            )?;
            for q in queries {
                stmt.execute(rusqlite::params![q.ts, q.fqdn, q.blocked as i32])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Move every buffered query into the archive, deriving each row's
    /// grouping key, and return the row ids that were created.
    pub fn persist(&self) -> Result<Option<RowRange>> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let pending: Vec<BufferedQuery> = {
            let mut stmt =
                tx.prepare("SELECT ts, fqdn, blocked FROM query_buffer ORDER BY rowid")?;
            let rows = stmt.query_map([], |row| {
                Ok(BufferedQuery {
                    ts: row.get(0)?,
                    fqdn: row.get(1)?,
                    blocked: row.get::<_, i64>(2)? != 0,
                })
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        if pending.is_empty() {
            return Ok(None);
        }

        let mut first = None;
        let mut last = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO query_log (ts, fqdn, domain, blocked) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for q in &pending {
                let id = stmt.insert(rusqlite::params![
                    q.ts,
                    q.fqdn,
                    grouping_key(&q.fqdn),
                    q.blocked as i32,
                ])?;
                first.get_or_insert(id);
                last = id;
            }
        }
        tx.execute("DELETE FROM query_buffer", [])?;
        tx.commit()?;

        let range = first.and_then(|start| RowRange::new(start, last));
        debug!("Persisted {} buffered queries into {:?}", pending.len(), range);
        Ok(range)
    }

    /// Delete archived rows older than `cutoff` (unix seconds).
    pub fn delete_older_than(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM query_log WHERE ts < ?1",
            rusqlite::params![cutoff],
        )?;
        Ok(deleted)
    }

    /// Reclaim space left by deletions.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM").context("VACUUM failed")?;
        Ok(())
    }

    pub fn buffer_len(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM query_buffer")
    }

    pub fn archive_len(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM query_log")
    }

    /// Highest archive row id ever handed out.
    pub fn last_row_id(&self) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT seq FROM sqlite_sequence WHERE name = 'query_log'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    fn count(&self, sql: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    /// Run `f` with the connection lock held.
    /// Used by the query and filter modules.
    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_append() {
        let store = LogStore::open_in_memory().unwrap();
        store.append("example.com", false).unwrap();
        store.append_at("ads.example.com", true, 100).unwrap();
        assert_eq!(store.buffer_len().unwrap(), 2);
        assert_eq!(store.archive_len().unwrap(), 0);
    }

    #[test]
    fn test_persist_moves_buffer() {
        let store = LogStore::open_in_memory().unwrap();
        assert_eq!(store.persist().unwrap(), None);

        let batch: Vec<BufferedQuery> = (0..5)
            .map(|i| BufferedQuery {
                ts: 100 + i,
                fqdn: format!("host{}.example.com", i),
                blocked: i % 2 == 0,
            })
            .collect();
        store.append_batch(&batch).unwrap();

        let range = store.persist().unwrap().unwrap();
        assert_eq!(range, RowRange { start: 1, end: 5 });
        assert_eq!(store.buffer_len().unwrap(), 0);
        assert_eq!(store.archive_len().unwrap(), 5);

        store.append_at("next.com", false, 200).unwrap();
        assert_eq!(store.persist().unwrap(), RowRange::new(6, 6));
        assert_eq!(store.last_row_id().unwrap(), Some(6));
    }

    #[test]
    fn test_row_ids_not_reused_after_delete() {
        let store = LogStore::open_in_memory().unwrap();
        store.append_at("a.com", false, 10).unwrap();
        store.append_at("b.com", false, 20).unwrap();
        store.persist().unwrap();

        assert_eq!(store.delete_older_than(25).unwrap(), 2);
        store.vacuum().unwrap();

        store.append_at("c.com", false, 30).unwrap();
        assert_eq!(store.persist().unwrap(), RowRange::new(3, 3));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.sqlite");
        let path = path.to_str().unwrap();
        {
            let store = LogStore::open(path).unwrap();
            store.append_at("a.com", false, 1).unwrap();
            store.persist().unwrap();
        }
        let store = LogStore::open(path).unwrap();
        assert_eq!(store.archive_len().unwrap(), 1);
    }
}
