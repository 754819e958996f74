use clap::{Parser, Subcommand};
use hearth_core::config::DEFAULT_QUEUE;
use hearth_lock::LockManager;
use hearth_queue::{Payload, Queue};
use serde_json::Value;

/// Durable SQLite job queue: run workers and inspect queues.
#[derive(Debug, Parser)]
#[command(name = "hearth", version)]
pub struct Cli {
    /// Config file (default: $HEARTH_CONFIG or ~/.hearth/hearth.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Drain a queue with the built-in handlers until interrupted.
    Work {
        /// Queue to drain (default: worker.queue from config).
        #[arg(long)]
        queue: Option<String>,
        /// Stop after this many jobs.
        #[arg(long)]
        max_jobs: Option<u64>,
    },
    /// Enqueue a job.
    Push {
        /// Handler name stored in the payload.
        job: String,
        /// Job data as a JSON object.
        #[arg(long, default_value = "{}")]
        data: String,
        #[arg(long, default_value = DEFAULT_QUEUE)]
        queue: String,
        /// Seconds before the job becomes visible.
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },
    /// Count jobs that are ready to run.
    Size {
        #[arg(long, default_value = DEFAULT_QUEUE)]
        queue: String,
    },
    /// Delete every job on a queue, including reserved ones.
    Clear {
        #[arg(long, default_value = DEFAULT_QUEUE)]
        queue: String,
    },
    /// List terminally failed jobs, newest first.
    Failed {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Report whether an advisory lock is currently held.
    LockStatus { name: String },
}

/// Run every command except `work` and return what to print.
pub fn execute(command: &Command, queue: &Queue, locks: &LockManager) -> anyhow::Result<String> {
    match command {
        Command::Work { .. } => anyhow::bail!("`work` runs through the worker loop"),
        Command::Push {
            job,
            data,
            queue: name,
            delay,
        } => {
            let data: Value = serde_json::from_str(data)
                .map_err(|e| anyhow::anyhow!("--data is not valid JSON: {e}"))?;
            let id = queue.push(job, data, name, *delay)?;
            Ok(format!("pushed job {id} onto '{name}'"))
        }
        Command::Size { queue: name } => Ok(queue.size(name)?.to_string()),
        Command::Clear { queue: name } => {
            let removed = queue.clear(name)?;
            Ok(format!("removed {removed} job(s) from '{name}'"))
        }
        Command::Failed { queue: name, limit } => {
            let failed = queue.failed(name.as_deref(), *limit)?;
            if failed.is_empty() {
                return Ok("no failed jobs".to_string());
            }
            let lines: Vec<String> = failed
                .iter()
                .map(|f| {
                    let job = Payload::decode(&f.payload)
                        .map(|p| p.job)
                        .unwrap_or_else(|_| "<undecodable>".to_string());
                    format!(
                        "#{} [{}] {} at {}: {}",
                        f.id,
                        f.queue,
                        job,
                        f.failed_at.format("%Y-%m-%d %H:%M:%S"),
                        f.exception
                    )
                })
                .collect();
            Ok(lines.join("\n"))
        }
        Command::LockStatus { name } => {
            let state = if locks.is_locked(name)? {
                "locked"
            } else {
                "free"
            };
            Ok(format!("{name}: {state}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_queue::Storage;
    use std::time::Duration;

    fn fixtures() -> (Queue, LockManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let locks = LockManager::new(dir.path(), Duration::from_millis(10), Duration::from_secs(1))
            .expect("locks");
        (Queue::new(Storage::open_in_memory().unwrap()), locks, dir)
    }

    fn parse(args: &[&str]) -> Command {
        Cli::try_parse_from(args).expect("parse").command
    }

    #[test]
    fn push_defaults() {
        match parse(&["hearth", "push", "SendEmail"]) {
            Command::Push {
                job,
                data,
                queue,
                delay,
            } => {
                assert_eq!(job, "SendEmail");
                assert_eq!(data, "{}");
                assert_eq!(queue, "default");
                assert_eq!(delay, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["hearth", "size", "--config", "/tmp/h.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("/tmp/h.toml"));
    }

    #[test]
    fn push_then_size_then_clear() {
        let (queue, locks, _dir) = fixtures();
        let out = execute(
            &parse(&["hearth", "push", "SendEmail", "--data", r#"{"to":"a@b.com"}"#]),
            &queue,
            &locks,
        )
        .unwrap();
        assert!(out.starts_with("pushed job "));

        let size = execute(&parse(&["hearth", "size"]), &queue, &locks).unwrap();
        assert_eq!(size, "1");

        let cleared = execute(&parse(&["hearth", "clear"]), &queue, &locks).unwrap();
        assert_eq!(cleared, "removed 1 job(s) from 'default'");
    }

    #[test]
    fn push_rejects_bad_json() {
        let (queue, locks, _dir) = fixtures();
        let err = execute(
            &parse(&["hearth", "push", "X", "--data", "{oops"]),
            &queue,
            &locks,
        )
        .unwrap_err();
        assert!(err.to_string().contains("--data"));
    }

    #[test]
    fn push_rejects_delay_past_last_timestamp() {
        let (queue, locks, _dir) = fixtures();
        let err = execute(
            &parse(&["hearth", "push", "X", "--delay", "10000000000000"]),
            &queue,
            &locks,
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert_eq!(queue.size("default").unwrap(), 0);
    }

    #[test]
    fn failed_listing() {
        let (queue, locks, _dir) = fixtures();
        assert_eq!(
            execute(&parse(&["hearth", "failed"]), &queue, &locks).unwrap(),
            "no failed jobs"
        );

        let id = queue.push("Charge", (), "billing", 0).unwrap();
        queue.mark_failed(id, "card declined").unwrap();
        let out = execute(&parse(&["hearth", "failed", "--queue", "billing"]), &queue, &locks)
            .unwrap();
        assert!(out.contains("[billing] Charge"));
        assert!(out.ends_with("card declined"));
    }

    #[test]
    fn lock_status_reports_holders() {
        let (queue, locks, dir) = fixtures();
        let cmd = parse(&["hearth", "lock-status", "nightly"]);
        assert_eq!(execute(&cmd, &queue, &locks).unwrap(), "nightly: free");

        let holder =
            LockManager::new(dir.path(), Duration::from_millis(10), Duration::from_secs(1)).unwrap();
        assert!(holder.acquire("nightly", Duration::from_millis(50)).unwrap());
        assert_eq!(execute(&cmd, &queue, &locks).unwrap(), "nightly: locked");
    }
}
