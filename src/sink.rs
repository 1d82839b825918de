//! Load Sink: idempotent upserts keyed by natural key.
//!
//! Loading the same records twice leaves the store exactly as loading them
//! once. A record whose key is already present is not overwritten; it is
//! counted in [`LoadResult::rows_skipped_duplicate`]. Each `upsert` call is
//! atomic: either every row of the batch becomes visible or none does.

use crate::error::{EtlError, Result};
use crate::pool::{self, ConnectionPool};
use crate::record::{LogEntry, NaturalKey, ParsedRecord, Transaction};
use crate::report::LoadResult;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

/// Target store for accepted records.
pub trait LoadSink: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Insert every record whose natural key is not yet stored.
    ///
    /// # Errors
    /// [`EtlError::Storage`], classified retryable for lock and connectivity
    /// problems. Nothing from the batch is visible after an error.
    fn upsert(&self, records: &[ParsedRecord]) -> Result<LoadResult>;

    /// Committed rows across all tables.
    fn row_count(&self) -> Result<u64>;

    fn contains_key(&self, key: &NaturalKey) -> Result<bool>;

    /// Every stored natural key, sorted.
    fn natural_keys(&self) -> Result<Vec<NaturalKey>>;

    /// SHA-256 over the sorted natural keys, hex encoded. Two stores with the
    /// same digest hold the same set of keys.
    fn natural_key_digest(&self) -> Result<String> {
        let mut keys = self.natural_keys()?;
        keys.sort();
        Ok(digest_keys(&keys))
    }
}

pub fn digest_keys(keys: &[NaturalKey]) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S%.f";

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS transactions (
    order_id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    amount REAL NOT NULL,
    status TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS request_logs (
    log_key TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    response_time_ms REAL NOT NULL,
    user_agent TEXT NOT NULL,
    hour INTEGER NOT NULL,
    is_server_error INTEGER NOT NULL
);
";

const INSERT_TRANSACTION: &str = "INSERT INTO transactions (order_id, user_id, amount, status, timestamp) \
     VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(order_id) DO NOTHING";

const INSERT_LOG: &str = "INSERT INTO request_logs \
     (log_key, timestamp, endpoint, status_code, response_time_ms, user_agent, hour, is_server_error) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) ON CONFLICT(log_key) DO NOTHING";

/// SQLite store behind a bounded connection pool.
///
/// The database runs in WAL mode so readers see only committed chunks while
/// loads are in flight; writers wait on each other through `busy_timeout`.
pub struct SqliteSink {
    path: PathBuf,
    pool: ConnectionPool,
}

impl std::fmt::Debug for SqliteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSink")
            .field("path", &self.path)
            .field("pool", &self.pool)
            .finish()
    }
}

impl SqliteSink {
    /// Open (creating if needed) the database at `path` behind a pool of
    /// `pool_size` connections.
    ///
    /// # Errors
    /// [`EtlError::Io`] if the parent directory cannot be created,
    /// [`EtlError::Storage`] if SQLite fails to open or migrate,
    /// [`EtlError::Config`] if `pool_size` is 0.
    pub fn open(path: impl AsRef<Path>, pool_size: usize, acquire_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| EtlError::io(parent.display().to_string(), e))?;
        }
        {
            let conn = Connection::open(path)?;
            let mode = pool::configure(&conn, pool::busy_timeout_for(acquire_timeout))?;
            conn.execute_batch(CREATE_TABLES)?;
            debug!(path = %path.display(), journal_mode = %mode, pool_size, "sqlite store ready");
        }
        Ok(Self {
            path: path.to_path_buf(),
            pool: ConnectionPool::sqlite(path, pool_size, acquire_timeout)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let conn = self.pool.acquire()?;
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

fn insert_transaction(stmt: &mut rusqlite::CachedStatement<'_>, t: &Transaction) -> Result<usize> {
    Ok(stmt.execute(params![
        t.order_id,
        t.user_id,
        t.amount,
        t.status,
        t.timestamp.format(TIMESTAMP_FMT).to_string(),
    ])?)
}

fn insert_log(stmt: &mut rusqlite::CachedStatement<'_>, l: &LogEntry) -> Result<usize> {
    Ok(stmt.execute(params![
        l.log_key,
        l.timestamp.format(TIMESTAMP_FMT).to_string(),
        l.endpoint,
        l.status_code,
        l.response_time_ms,
        l.user_agent,
        l.hour(),
        l.is_server_error(),
    ])?)
}

impl LoadSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn upsert(&self, records: &[ParsedRecord]) -> Result<LoadResult> {
        let mut result = LoadResult::default();
        if records.is_empty() {
            return Ok(result);
        }
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction()?;
        {
            let mut tx_stmt = tx.prepare_cached(INSERT_TRANSACTION)?;
            let mut log_stmt = tx.prepare_cached(INSERT_LOG)?;
            for record in records {
                let changed = match record {
                    ParsedRecord::Transaction(t) => insert_transaction(&mut tx_stmt, t)?,
                    ParsedRecord::Log(l) => insert_log(&mut log_stmt, l)?,
                };
                if changed == 1 {
                    result.rows_written += 1;
                } else {
                    result.rows_skipped_duplicate += 1;
                }
            }
        }
        tx.commit()?;
        trace!(
            written = result.rows_written,
            duplicates = result.rows_skipped_duplicate,
            "upsert committed"
        );
        Ok(result)
    }

    fn row_count(&self) -> Result<u64> {
        self.count("SELECT (SELECT COUNT(*) FROM transactions) + (SELECT COUNT(*) FROM request_logs)")
    }

    fn contains_key(&self, key: &NaturalKey) -> Result<bool> {
        let conn = self.pool.acquire()?;
        let found = match key {
            NaturalKey::OrderId(id) => conn
                .query_row(
                    "SELECT 1 FROM transactions WHERE order_id = ?1",
                    [id],
                    |_| Ok(()),
                )
                .optional()?,
            NaturalKey::LogKey(k) => conn
                .query_row(
                    "SELECT 1 FROM request_logs WHERE log_key = ?1",
                    [k],
                    |_| Ok(()),
                )
                .optional()?,
        };
        Ok(found.is_some())
    }

    fn natural_keys(&self) -> Result<Vec<NaturalKey>> {
        let conn = self.pool.acquire()?;
        let mut keys = Vec::new();
        let mut stmt = conn.prepare("SELECT order_id FROM transactions ORDER BY order_id")?;
        for id in stmt.query_map([], |row| row.get::<_, i64>(0))? {
            keys.push(NaturalKey::OrderId(id?));
        }
        let mut stmt = conn.prepare("SELECT log_key FROM request_logs ORDER BY log_key")?;
        for key in stmt.query_map([], |row| row.get::<_, String>(0))? {
            keys.push(NaturalKey::LogKey(key?));
        }
        Ok(keys)
    }
}

/// In-process store with the same semantics as [`SqliteSink`].
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<BTreeMap<NaturalKey, ParsedRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the stored record for `key`.
    pub fn get(&self, key: &NaturalKey) -> Option<ParsedRecord> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl LoadSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn upsert(&self, records: &[ParsedRecord]) -> Result<LoadResult> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut result = LoadResult::default();
        for record in records {
            let key = record.natural_key();
            if rows.contains_key(&key) {
                result.rows_skipped_duplicate += 1;
            } else {
                rows.insert(key, record.clone());
                result.rows_written += 1;
            }
        }
        Ok(result)
    }

    fn row_count(&self) -> Result<u64> {
        Ok(self.rows.lock().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }

    fn contains_key(&self, key: &NaturalKey) -> Result<bool> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key))
    }

    fn natural_keys(&self) -> Result<Vec<NaturalKey>> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

impl<S: LoadSink + ?Sized> LoadSink for std::sync::Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn upsert(&self, records: &[ParsedRecord]) -> Result<LoadResult> {
        (**self).upsert(records)
    }

    fn row_count(&self) -> Result<u64> {
        (**self).row_count()
    }

    fn contains_key(&self, key: &NaturalKey) -> Result<bool> {
        (**self).contains_key(key)
    }

    fn natural_keys(&self) -> Result<Vec<NaturalKey>> {
        (**self).natural_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn order(id: i64) -> ParsedRecord {
        ParsedRecord::Transaction(Transaction {
            order_id: id,
            user_id: 1,
            amount: 9.99,
            status: "completed".into(),
            timestamp: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(8, 30, 0)
                .unwrap(),
            line: id as u64,
            offset: 0,
        })
    }

    #[test]
    fn sqlite_upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteSink::open(dir.path().join("t.db"), 2, Duration::from_secs(1)).unwrap();
        let batch = vec![order(1), order(2), order(2)];
        let first = sink.upsert(&batch).unwrap();
        assert_eq!(first.rows_written, 2);
        assert_eq!(first.rows_skipped_duplicate, 1);
        let again = sink.upsert(&batch).unwrap();
        assert_eq!(again.rows_written, 0);
        assert_eq!(sink.row_count().unwrap(), 2);
        assert!(sink.contains_key(&NaturalKey::OrderId(2)).unwrap());
        assert!(!sink.contains_key(&NaturalKey::OrderId(3)).unwrap());
    }

    #[test]
    fn memory_and_sqlite_digests_agree() {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = SqliteSink::open(dir.path().join("d.db"), 1, Duration::from_secs(1)).unwrap();
        let memory = MemorySink::new();
        let batch: Vec<_> = [5, 3, 9].into_iter().map(order).collect();
        sqlite.upsert(&batch).unwrap();
        memory.upsert(&batch).unwrap();
        assert_eq!(
            sqlite.natural_key_digest().unwrap(),
            memory.natural_key_digest().unwrap()
        );
    }
}
