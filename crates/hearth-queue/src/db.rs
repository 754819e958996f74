use rusqlite::Connection;

use crate::error::Result;

/// Initialise the queue schema in `conn`.
///
/// Creates the `jobs` and `failed_jobs` tables (idempotent) plus the
/// `(queue, available_at)` index the eligibility scan relies on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            queue         TEXT    NOT NULL DEFAULT 'default',
            payload       TEXT    NOT NULL,   -- {\"job\": ..., \"data\": {...}}
            attempts      INTEGER NOT NULL DEFAULT 0,
            available_at  TEXT    NOT NULL,   -- YYYY-MM-DD HH:MM:SS (UTC)
            reserved_at   TEXT,               -- NULL while waiting to be claimed
            created_at    TEXT    NOT NULL
        );

        -- Eligibility scan: WHERE queue = ? AND available_at <= ? ORDER BY id
        CREATE INDEX IF NOT EXISTS idx_jobs_queue_available
            ON jobs (queue, available_at);

        CREATE TABLE IF NOT EXISTS failed_jobs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            queue       TEXT    NOT NULL,
            payload     TEXT    NOT NULL,
            exception   TEXT    NOT NULL,
            failed_at   TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_failed_jobs_queue
            ON failed_jobs (queue, id DESC);
        ",
    )?;
    Ok(())
}
