use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_SECS: u64 = 60; // release delay = backoff_secs * attempts
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 50;

/// Top-level config (hearth.toml + HEARTH_* env overrides).
///
/// Nested keys use a double underscore in the environment:
/// `HEARTH_WORKER__POLL_INTERVAL_MS=250`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HearthConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// SQLite's own busy handler wait before `SQLITE_BUSY` surfaces to us.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Retry-on-busy settings for storage operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// When set, reservations older than this are released back to the queue
    /// whenever the worker finds the queue empty. Off by default.
    #[serde(default)]
    pub reclaim_after_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            reclaim_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_dir")]
    pub dir: String,
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_lock_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: default_lock_dir(),
            timeout_secs: default_lock_timeout_secs(),
            poll_interval_ms: default_lock_poll_interval_ms(),
        }
    }
}

fn default_db_path() -> String {
    format!("{}/hearth.db", hearth_home())
}
fn default_busy_timeout_ms() -> u64 {
    1_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    20
}
fn default_max_delay_ms() -> u64 {
    1_000
}
fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_secs() -> u64 {
    DEFAULT_BACKOFF_SECS
}
fn default_lock_dir() -> String {
    format!("{}/locks", hearth_home())
}
fn default_lock_timeout_secs() -> u64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}
fn default_lock_poll_interval_ms() -> u64 {
    DEFAULT_LOCK_POLL_INTERVAL_MS
}

fn hearth_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.hearth")
}

impl HearthConfig {
    /// Load config from a TOML file with HEARTH_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.hearth/hearth.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::HearthError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(HearthConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("HEARTH_").split("__").ignore(&["config"]))
    }
}

fn default_config_path() -> String {
    format!("{}/hearth.toml", hearth_home())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        let config = HearthConfig::load(path.to_str()).expect("load");
        assert_eq!(config.worker.queue, "default");
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.worker.backoff_secs, 60);
        assert_eq!(config.lock.poll_interval_ms, 50);
        assert!(config.worker.reclaim_after_secs.is_none());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hearth.toml");
        std::fs::write(
            &path,
            "[worker]\nqueue = \"mail\"\nreclaim_after_secs = 600\n\n[storage]\nmax_retries = 9\n",
        )
        .expect("write");

        let config = HearthConfig::load(path.to_str()).expect("load");
        assert_eq!(config.worker.queue, "mail");
        assert_eq!(config.worker.reclaim_after_secs, Some(600));
        assert_eq!(config.worker.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.storage.max_retries, 9);
        assert_eq!(config.storage.base_delay_ms, 20);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hearth.toml");
        std::fs::write(&path, "[worker\nqueue = ").expect("write");

        let err = HearthConfig::load(path.to_str()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
