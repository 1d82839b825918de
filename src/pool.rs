//! Bounded connection pool for the SQLite store.
//!
//! An `r2d2` pool of at most `size` connections shared by every worker. Each
//! connection is switched to WAL mode with a busy timeout as it is opened.
//! [`ConnectionPool::acquire`] waits up to the acquire timeout and hands out a
//! lease that goes back to the pool on drop, on every exit path, so the pool
//! size caps how many loads run at once. Checkouts are counted through an
//! r2d2 event handler.

use crate::error::{EtlError, Result};
use r2d2::event::{CheckinEvent, CheckoutEvent, HandleEvent};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A leased connection; returns to the pool when dropped.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Longest wait handed to r2d2 or SQLite. r2d2 adds its timeout to
/// `Instant::now()` unchecked and SQLite takes milliseconds as an `i32`.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default)]
struct Usage {
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
}

#[derive(Debug)]
struct UsageTracker(Arc<Usage>);

impl HandleEvent for UsageTracker {
    fn handle_checkout(&self, _event: CheckoutEvent) {
        let now = self.0.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak_in_use.fetch_max(now, Ordering::SeqCst);
    }

    fn handle_checkin(&self, _event: CheckinEvent) {
        let _ = self
            .0
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Apply the per-connection settings; returns the resulting journal mode.
pub(crate) fn configure(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<String> {
    conn.busy_timeout(busy_timeout)?;
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(mode)
}

/// SQLite busy timeout derived from the pool acquire timeout.
pub(crate) fn busy_timeout_for(acquire_timeout: Duration) -> Duration {
    acquire_timeout.clamp(Duration::from_millis(100), MAX_WAIT)
}

pub struct ConnectionPool {
    inner: r2d2::Pool<SqliteConnectionManager>,
    usage: Arc<Usage>,
    acquire_timeout: Duration,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size())
            .field("acquire_timeout", &self.acquire_timeout)
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Pool of up to `size` connections to the database file at `path`.
    ///
    /// # Errors
    /// [`EtlError::Config`] if `size` is 0, a transient [`EtlError::Storage`]
    /// if the initial connections cannot be opened in time.
    pub fn sqlite(path: &Path, size: usize, acquire_timeout: Duration) -> Result<Self> {
        if size == 0 {
            return Err(EtlError::Config("connection pool needs at least one connection".into()));
        }
        let busy_timeout = busy_timeout_for(acquire_timeout);
        let manager = SqliteConnectionManager::file(path)
            .with_init(move |conn| configure(conn, busy_timeout).map(|_| ()));
        let usage = Arc::new(Usage::default());
        let inner = r2d2::Pool::builder()
            .max_size(u32::try_from(size).unwrap_or(u32::MAX))
            .connection_timeout(acquire_timeout.clamp(Duration::from_millis(1), MAX_WAIT))
            .event_handler(Box::new(UsageTracker(Arc::clone(&usage))))
            .build(manager)
            .map_err(|e| EtlError::storage_transient(format!("connection pool for {}: {e}", path.display())))?;
        Ok(Self {
            inner,
            usage,
            acquire_timeout,
        })
    }

    /// Maximum number of connections.
    pub fn size(&self) -> usize {
        self.inner.max_size() as usize
    }

    /// Borrow a connection, waiting up to the acquire timeout.
    ///
    /// # Errors
    /// A transient [`EtlError::Storage`] when no connection frees up in time.
    pub fn acquire(&self) -> Result<PooledConnection> {
        self.inner.get().map_err(|e| {
            EtlError::storage_transient(format!(
                "no pooled connection within {:?} ({} max): {e}",
                self.acquire_timeout,
                self.size()
            ))
        })
    }

    /// Connections currently leased out.
    pub fn in_use(&self) -> usize {
        self.usage.in_use.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous leases seen so far.
    pub fn peak_in_use(&self) -> usize {
        self.usage.peak_in_use.load(Ordering::SeqCst)
    }
}
