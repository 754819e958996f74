use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hearth_core::config::{DatabaseConfig, StorageConfig};
use rusqlite::{Connection, ErrorCode, Params, Row, Transaction, TransactionBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{QueueError, Result};

/// A single SQLite connection with retry-on-busy around every operation.
///
/// Each worker or producer opens its own `Storage`; SQLite serialises writers
/// across connections and `SQLITE_BUSY` / `SQLITE_LOCKED` are retried here
/// with capped exponential backoff plus jitter.
pub struct Storage {
    conn: Mutex<Connection>,
    retry: StorageConfig,
}

impl Storage {
    /// Open (or create) the database file, switch it to WAL and make sure the
    /// queue schema exists.
    pub fn open(path: impl AsRef<Path>, db: &DatabaseConfig, retry: StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(hearth_core::HearthError::from)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(db.busy_timeout_ms))?;
        // journal_mode returns a row, so it can't go through execute_batch.
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened queue database");
        Self::from_connection(conn, retry)
    }

    /// Open using the `[database]` and `[storage]` config sections.
    pub fn from_config(db: &DatabaseConfig, retry: &StorageConfig) -> Result<Self> {
        Self::open(&db.path, db, retry.clone())
    }

    /// Private in-memory database, mainly for tests and one-shot tools.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, StorageConfig::default())
    }

    /// Wrap an already-open connection and run the schema migration on it.
    pub fn from_connection(conn: Connection, retry: StorageConfig) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry,
        })
    }

    /// Execute a single statement, returning the number of changed rows.
    pub fn execute<P: Params + Clone>(&self, sql: &str, params: P) -> Result<usize> {
        self.with_retry(|conn| conn.execute(sql, params.clone()))
    }

    /// Execute an INSERT and return the new row id.
    pub fn insert<P: Params + Clone>(&self, sql: &str, params: P) -> Result<i64> {
        self.with_retry(|conn| {
            conn.execute(sql, params.clone())?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Run a query and map every row.
    pub fn query<T, P, F>(&self, sql: &str, params: P, mut map: F) -> Result<Vec<T>>
    where
        P: Params + Clone,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params.clone(), &mut map)?;
            let collected = rows.collect::<rusqlite::Result<Vec<T>>>();
            collected
        })
    }

    /// Run `f` inside an `IMMEDIATE` transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. The write lock is
    /// taken up front so a transaction never fails half way through on a
    /// read-to-write upgrade. The whole closure is re-run on busy errors.
    pub fn transaction<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut conn = self.lock_conn();
        self.retrying(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Run `f` against the connection, retrying transient contention.
    pub fn with_retry<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.lock_conn();
        self.retrying(|| f(&conn))
    }

    fn retrying<T>(&self, mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    if attempt > self.retry.max_retries {
                        warn!(attempts = attempt, error = %e, "storage still busy, giving up");
                        return Err(QueueError::StorageOperationFailed {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.backoff(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "storage busy, retrying");
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(QueueError::Database(e)),
            }
        }
    }

    /// Delay before retry number `attempt` (1-based): half of the capped
    /// exponential step plus up to another half of random jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let step = self
            .retry
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry.max_delay_ms);
        let half = step / 2;
        let jitter = if half == 0 {
            0
        } else {
            (Uuid::new_v4().as_u128() as u64) % (half + 1)
        };
        Duration::from_millis(step - half + jitter)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Busy/locked conditions that go away once the other writer finishes.
fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
