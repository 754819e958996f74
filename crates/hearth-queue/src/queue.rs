use std::sync::Arc;

use chrono::{DateTime, Utc};
use hearth_core::clock::{checked_earlier, checked_later, format_ts, parse_ts, Clock, SystemClock};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{QueueError, Result};
use crate::storage::Storage;
use crate::types::{FailedJob, Job, Payload};

const JOB_COLUMNS: &str = "id, queue, payload, attempts, available_at, reserved_at, created_at";

/// Durable FIFO-per-queue job storage on top of [`Storage`].
///
/// Holds no in-memory job state: every call is a read or write against the
/// `jobs` / `failed_jobs` tables, so several `Queue`s on separate connections
/// can share one database file.
pub struct Queue {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl Queue {
    pub fn new(storage: Storage) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn after(&self, now: DateTime<Utc>, delay_secs: u64) -> Result<String> {
        checked_later(now, delay_secs)
            .map(format_ts)
            .ok_or(QueueError::DelayOutOfRange { delay_secs })
    }

    /// Enqueue a job, visible to `pop` after `delay_secs`.
    #[instrument(skip(self, data))]
    pub fn push(
        &self,
        job_type: &str,
        data: impl Serialize,
        queue: &str,
        delay_secs: u64,
    ) -> Result<i64> {
        let payload = Payload::new(job_type, data)?.encode()?;
        let now = self.now();
        let available_at = self.after(now, delay_secs)?;
        let created_at = format_ts(now);

        let id = self.storage.insert(
            "INSERT INTO jobs (queue, payload, attempts, available_at, reserved_at, created_at)
             VALUES (?1, ?2, 0, ?3, NULL, ?4)",
            params![queue, payload, available_at, created_at],
        )?;
        info!(job_id = id, queue, delay_secs, "job pushed");
        Ok(id)
    }

    /// Enqueue a job that becomes visible after `delay_secs`.
    pub fn later(
        &self,
        delay_secs: u64,
        job_type: &str,
        data: impl Serialize,
        queue: &str,
    ) -> Result<i64> {
        self.push(job_type, data, queue, delay_secs)
    }

    /// Claim the oldest eligible job on `queue`.
    ///
    /// The claim is one conditional UPDATE, so two poppers can never reserve
    /// the same row: whoever loses the race sees `reserved_at` already set
    /// and matches nothing.
    #[instrument(skip(self))]
    pub fn pop(&self, queue: &str) -> Result<Option<Job>> {
        let now = format_ts(self.now());
        let sql = format!(
            "UPDATE jobs
                SET reserved_at = ?1, attempts = attempts + 1
              WHERE id = (SELECT id FROM jobs
                           WHERE queue = ?2
                             AND reserved_at IS NULL
                             AND available_at <= ?1
                           ORDER BY id
                           LIMIT 1)
                AND reserved_at IS NULL
             RETURNING {JOB_COLUMNS}"
        );
        let job = self
            .storage
            .transaction(|tx| tx.query_row(&sql, params![now, queue], row_to_job).optional())?;

        if let Some(ref job) = job {
            debug!(job_id = job.id, attempts = job.attempts, "job reserved");
        }
        Ok(job)
    }

    /// Acknowledge a job by removing it. Returns whether a row was deleted.
    #[instrument(skip(self))]
    pub fn delete_job(&self, id: i64) -> Result<bool> {
        let n = self
            .storage
            .transaction(|tx| tx.execute("DELETE FROM jobs WHERE id = ?1", params![id]))?;
        Ok(n > 0)
    }

    /// Put a reserved job back, visible again after `delay_secs`.
    #[instrument(skip(self))]
    pub fn release(&self, id: i64, delay_secs: u64) -> Result<bool> {
        let available_at = self.after(self.now(), delay_secs)?;
        let n = self.storage.transaction(|tx| {
            tx.execute(
                "UPDATE jobs SET reserved_at = NULL, available_at = ?1 WHERE id = ?2",
                params![available_at, id],
            )
        })?;
        Ok(n > 0)
    }

    /// Move a job into `failed_jobs` with the captured error text.
    ///
    /// Copy and delete share one transaction, and the copy runs first, so a
    /// failure part way through leaves the job where it was. Returns false if
    /// the job no longer exists.
    #[instrument(skip(self, exception))]
    pub fn mark_failed(&self, id: i64, exception: &str) -> Result<bool> {
        let failed_at = format_ts(self.now());
        let moved = self.storage.transaction(|tx| {
            let copied = tx.execute(
                "INSERT INTO failed_jobs (queue, payload, exception, failed_at)
                 SELECT queue, payload, ?2, ?3 FROM jobs WHERE id = ?1",
                params![id, exception, failed_at],
            )?;
            if copied == 0 {
                return Ok(false);
            }
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            Ok(true)
        })?;

        if moved {
            warn!(job_id = id, "job moved to failed_jobs");
        }
        Ok(moved)
    }

    /// Number of jobs on `queue` that `pop` could claim right now.
    pub fn size(&self, queue: &str) -> Result<u64> {
        let now = format_ts(self.now());
        let count = self.storage.with_retry(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM jobs
                  WHERE queue = ?1 AND reserved_at IS NULL AND available_at <= ?2",
                params![queue, now],
                |row| row.get::<_, i64>(0),
            )
        })?;
        Ok(count.max(0) as u64)
    }

    /// Drop every job on `queue`, reserved or not. Returns the number removed.
    #[instrument(skip(self))]
    pub fn clear(&self, queue: &str) -> Result<usize> {
        let n = self
            .storage
            .transaction(|tx| tx.execute("DELETE FROM jobs WHERE queue = ?1", params![queue]))?;
        info!(queue, removed = n, "queue cleared");
        Ok(n)
    }

    /// Read a job without claiming it.
    pub fn get(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let job = self
            .storage
            .with_retry(|conn| conn.query_row(&sql, params![id], row_to_job).optional())?;
        Ok(job)
    }

    /// Most recent failures first, optionally limited to one queue.
    pub fn failed(&self, queue: Option<&str>, limit: usize) -> Result<Vec<FailedJob>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.storage.query(
            "SELECT id, queue, payload, exception, failed_at FROM failed_jobs
              WHERE ?1 IS NULL OR queue = ?1
              ORDER BY id DESC
              LIMIT ?2",
            params![queue, limit],
            row_to_failed_job,
        )
    }

    /// Release reservations on `queue` that were taken more than
    /// `older_than_secs` ago, e.g. by a worker that crashed mid-job.
    ///
    /// Attempts are left as they are; the next claim counts as a new attempt.
    #[instrument(skip(self))]
    pub fn reclaim_stale(&self, queue: &str, older_than_secs: u64) -> Result<usize> {
        // nothing can have been reserved before year 1
        let Some(cutoff) = checked_earlier(self.now(), older_than_secs).map(format_ts) else {
            return Ok(0);
        };
        let n = self.storage.transaction(|tx| {
            tx.execute(
                "UPDATE jobs SET reserved_at = NULL
                  WHERE queue = ?1 AND reserved_at IS NOT NULL AND reserved_at <= ?2",
                params![queue, cutoff],
            )
        })?;
        if n > 0 {
            warn!(queue, reclaimed = n, "stale reservations released");
        }
        Ok(n)
    }
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let reserved_at = match row.get::<_, Option<String>>(5)? {
        Some(_) => Some(ts_column(row, 5)?),
        None => None,
    };
    Ok(Job {
        id: row.get(0)?,
        queue: row.get(1)?,
        payload: row.get(2)?,
        attempts: row.get(3)?,
        available_at: ts_column(row, 4)?,
        reserved_at,
        created_at: ts_column(row, 6)?,
    })
}

fn row_to_failed_job(row: &Row<'_>) -> rusqlite::Result<FailedJob> {
    Ok(FailedJob {
        id: row.get(0)?,
        queue: row.get(1)?,
        payload: row.get(2)?,
        exception: row.get(3)?,
        failed_at: ts_column(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use hearth_core::clock::ManualClock;
    use hearth_core::config::{DatabaseConfig, StorageConfig};
    use serde_json::json;
    use std::sync::Barrier;

    fn queue_with_clock() -> (Queue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = Queue::with_clock(Storage::open_in_memory().unwrap(), clock.clone());
        (queue, clock)
    }

    #[test]
    fn push_size_pop_delete_scenario() {
        let (queue, _) = queue_with_clock();
        let id = queue
            .push("SendEmail", json!({"to": "a@b.com"}), "default", 0)
            .unwrap();
        assert_eq!(queue.size("default").unwrap(), 1);

        let job = queue.pop("default").unwrap().expect("job");
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
        assert!(job.is_reserved());
        let payload = job.decode_payload().unwrap();
        assert_eq!(payload.job, "SendEmail");
        assert_eq!(payload.data["to"], "a@b.com");

        assert!(queue.delete_job(id).unwrap());
        assert_eq!(queue.size("default").unwrap(), 0);
        assert!(queue.get(id).unwrap().is_none());
    }

    #[test]
    fn pop_on_empty_queue_is_none() {
        let (queue, _) = queue_with_clock();
        assert!(queue.pop("default").unwrap().is_none());
    }

    #[test]
    fn pop_claims_in_id_order_and_respects_queue_names() {
        let (queue, _) = queue_with_clock();
        let first = queue.push("A", (), "default", 0).unwrap();
        let other = queue.push("B", (), "mail", 0).unwrap();
        let second = queue.push("C", (), "default", 0).unwrap();

        assert_eq!(queue.pop("default").unwrap().unwrap().id, first);
        assert_eq!(queue.pop("default").unwrap().unwrap().id, second);
        assert!(queue.pop("default").unwrap().is_none());
        assert_eq!(queue.pop("mail").unwrap().unwrap().id, other);
    }

    #[test]
    fn delay_is_honored() {
        let (queue, clock) = queue_with_clock();
        let id = queue.push("Report", (), "default", 60).unwrap();

        assert!(queue.pop("default").unwrap().is_none());
        assert_eq!(queue.size("default").unwrap(), 0);

        clock.advance(Duration::seconds(59));
        assert!(queue.pop("default").unwrap().is_none());

        clock.advance(Duration::seconds(1));
        assert_eq!(queue.size("default").unwrap(), 1);
        assert_eq!(queue.pop("default").unwrap().unwrap().id, id);
    }

    #[test]
    fn later_skips_ahead_of_delayed_jobs() {
        let (queue, _) = queue_with_clock();
        let delayed = queue.later(300, "Digest", (), "default").unwrap();
        let immediate = queue.push("Ping", (), "default", 0).unwrap();
        assert!(delayed < immediate);
        assert_eq!(queue.pop("default").unwrap().unwrap().id, immediate);
    }

    #[test]
    fn attempts_increase_by_one_per_claim() {
        let (queue, _) = queue_with_clock();
        let id = queue.push("Flaky", (), "default", 0).unwrap();

        for expected in 1..=4 {
            let before = queue.get(id).unwrap().unwrap().attempts;
            let job = queue.pop("default").unwrap().unwrap();
            assert_eq!(job.attempts, before + 1);
            assert_eq!(job.attempts, expected);
            assert!(queue.release(id, 0).unwrap());
        }
    }

    #[test]
    fn reserved_job_is_not_counted_or_claimed_again() {
        let (queue, _) = queue_with_clock();
        queue.push("A", (), "default", 0).unwrap();
        queue.pop("default").unwrap().unwrap();

        assert_eq!(queue.size("default").unwrap(), 0);
        assert!(queue.pop("default").unwrap().is_none());
    }

    #[test]
    fn release_applies_delay() {
        let (queue, clock) = queue_with_clock();
        let id = queue.push("A", (), "default", 0).unwrap();
        queue.pop("default").unwrap().unwrap();

        assert!(queue.release(id, 120).unwrap());
        let job = queue.get(id).unwrap().unwrap();
        assert!(job.reserved_at.is_none());
        assert_eq!(job.available_at, clock.now() + Duration::seconds(120));
        assert!(queue.pop("default").unwrap().is_none());

        clock.advance(Duration::seconds(120));
        assert_eq!(queue.pop("default").unwrap().unwrap().attempts, 2);
    }

    #[test]
    fn mark_failed_moves_row() {
        let (queue, _) = queue_with_clock();
        let id = queue.push("Charge", json!({"amount": 10}), "billing", 0).unwrap();
        let job = queue.pop("billing").unwrap().unwrap();

        assert!(queue.mark_failed(id, "card declined").unwrap());
        assert!(queue.get(id).unwrap().is_none());

        let failed = queue.failed(Some("billing"), 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].queue, "billing");
        assert_eq!(failed[0].payload, job.payload);
        assert_eq!(failed[0].exception, "card declined");

        // Second call finds nothing to move and must not duplicate the record.
        assert!(!queue.mark_failed(id, "again").unwrap());
        assert_eq!(queue.failed(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn failed_lists_newest_first_and_filters_by_queue() {
        let (queue, _) = queue_with_clock();
        let a = queue.push("A", (), "one", 0).unwrap();
        let b = queue.push("B", (), "two", 0).unwrap();
        let c = queue.push("C", (), "one", 0).unwrap();
        for id in [a, b, c] {
            queue.mark_failed(id, "boom").unwrap();
        }

        let all = queue.failed(None, 10).unwrap();
        let jobs: Vec<String> = all
            .iter()
            .map(|f| Payload::decode(&f.payload).unwrap().job)
            .collect();
        assert_eq!(jobs, vec!["C", "B", "A"]);

        assert_eq!(queue.failed(Some("one"), 10).unwrap().len(), 2);
        assert_eq!(queue.failed(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn clear_removes_reserved_and_pending_jobs() {
        let (queue, _) = queue_with_clock();
        queue.push("A", (), "default", 0).unwrap();
        queue.push("B", (), "default", 0).unwrap();
        queue.push("C", (), "default", 600).unwrap();
        let keep = queue.push("D", (), "other", 0).unwrap();
        queue.pop("default").unwrap().unwrap();

        assert_eq!(queue.clear("default").unwrap(), 3);
        assert!(queue.pop("default").unwrap().is_none());
        assert!(queue.get(keep).unwrap().is_some());
    }

    #[test]
    fn reclaim_only_touches_old_reservations() {
        let (queue, clock) = queue_with_clock();
        let old = queue.push("A", (), "default", 0).unwrap();
        queue.pop("default").unwrap().unwrap();

        clock.advance(Duration::seconds(300));
        let fresh = queue.push("B", (), "default", 0).unwrap();
        queue.pop("default").unwrap().unwrap();

        clock.advance(Duration::seconds(10));
        assert_eq!(queue.reclaim_stale("default", 60).unwrap(), 1);
        assert!(!queue.get(old).unwrap().unwrap().is_reserved());
        assert!(queue.get(fresh).unwrap().unwrap().is_reserved());

        let again = queue.pop("default").unwrap().unwrap();
        assert_eq!(again.id, old);
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn far_future_delay_stays_invisible() {
        let (queue, clock) = queue_with_clock();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        clock.set(start);
        let last = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();

        let id = queue
            .push("Far", (), "default", (last - start).num_seconds() as u64)
            .unwrap();
        assert_eq!(queue.get(id).unwrap().unwrap().available_at, last);
        assert_eq!(queue.size("default").unwrap(), 0);
        assert!(queue.pop("default").unwrap().is_none());
    }

    #[test]
    fn delay_past_year_9999_is_rejected() {
        let (queue, _) = queue_with_clock();
        for delay in [315_576_000_000, 10_000_000_000_000, u64::MAX] {
            let err = queue.push("X", (), "default", delay).unwrap_err();
            assert!(matches!(err, QueueError::DelayOutOfRange { delay_secs } if delay_secs == delay));
            assert!(matches!(
                queue.later(delay, "X", (), "default"),
                Err(QueueError::DelayOutOfRange { .. })
            ));
        }
        assert_eq!(queue.size("default").unwrap(), 0);
        assert!(queue.pop("default").unwrap().is_none());
    }

    #[test]
    fn release_with_huge_delay_leaves_job_reserved() {
        let (queue, _) = queue_with_clock();
        let id = queue.push("X", (), "default", 0).unwrap();
        queue.pop("default").unwrap().unwrap();

        assert!(matches!(
            queue.release(id, 10_000_000_000_000),
            Err(QueueError::DelayOutOfRange { .. })
        ));
        assert!(queue.get(id).unwrap().unwrap().is_reserved());
        assert!(queue.release(id, 0).unwrap());
    }

    #[test]
    fn reclaim_with_huge_age_is_a_no_op() {
        let (queue, _) = queue_with_clock();
        let id = queue.push("X", (), "default", 0).unwrap();
        queue.pop("default").unwrap().unwrap();

        assert_eq!(queue.reclaim_stale("default", u64::MAX).unwrap(), 0);
        assert_eq!(queue.reclaim_stale("default", 10_000_000_000_000).unwrap(), 0);
        assert!(queue.get(id).unwrap().unwrap().is_reserved());
    }

    #[test]
    fn concurrent_pops_never_double_reserve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let db = DatabaseConfig {
            path: path.display().to_string(),
            busy_timeout_ms: 1_000,
        };
        let retry = StorageConfig {
            max_retries: 20,
            base_delay_ms: 5,
            max_delay_ms: 50,
        };

        let producer = Queue::new(Storage::open(&path, &db, retry.clone()).unwrap());
        let id = producer.push("Only", (), "default", 0).unwrap();

        const POPPERS: usize = 8;
        let barrier = Arc::new(Barrier::new(POPPERS));
        let handles: Vec<_> = (0..POPPERS)
            .map(|_| {
                let queue = Queue::new(Storage::open(&path, &db, retry.clone()).unwrap());
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    queue.pop("default").unwrap()
                })
            })
            .collect();

        let claimed: Vec<Job> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(producer.get(id).unwrap().unwrap().attempts, 1);
    }
}
