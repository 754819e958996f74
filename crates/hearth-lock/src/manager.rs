use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use hearth_core::config::LockConfig;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::error::{LockError, Result};

/// Process-local owner of named file locks.
///
/// Construct one per process and share it by reference. Locks are not
/// re-entrant: acquiring a name this manager already holds waits like any
/// other caller would.
pub struct LockManager {
    dir: PathBuf,
    poll_interval: Duration,
    default_timeout: Duration,
    held: Mutex<HashMap<String, Flock<File>>>,
}

impl LockManager {
    /// Create a manager rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration, default_timeout: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            poll_interval,
            default_timeout,
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &LockConfig) -> Result<Self> {
        Self::new(
            &config.dir,
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Timeout used by callers that don't pick their own (10 s by default).
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Path of the backing file for `name`.
    pub fn lock_path(&self, name: &str) -> PathBuf {
        let digest = Sha256::digest(name.as_bytes());
        self.dir.join(format!("{}.lock", hex::encode(digest)))
    }

    /// Try to take `name` until `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. At least one attempt is made even with
    /// a zero timeout.
    #[instrument(skip(self), fields(timeout_ms = timeout.as_millis() as u64))]
    pub fn acquire(&self, name: &str, timeout: Duration) -> Result<bool> {
        let path = self.lock_path(name);
        let deadline = Instant::now() + timeout;

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    // The previous holder may have unlinked the file between our
                    // open and lock; then the path names a different inode (or
                    // none) and our lock excludes nobody.
                    if !still_linked(&lock, &path)? {
                        debug!(name, "locked a file that was since removed; retrying");
                        continue;
                    }
                    write_owner(&lock)?;
                    self.held_map().insert(name.to_string(), lock);
                    debug!(name, path = %path.display(), "lock acquired");
                    return Ok(true);
                }
                Err((_, Errno::EWOULDBLOCK)) => {}
                Err((_, errno)) => return Err(LockError::Io(io::Error::from(errno))),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(name, "lock acquisition timed out");
                return Ok(false);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Release `name` if this manager holds it. Idempotent.
    ///
    /// The backing file is unlinked while still locked, then unlocked. A
    /// waiter that opened the old file and locks it afterwards notices the
    /// path no longer names that file and starts over.
    pub fn release(&self, name: &str) {
        let Some(lock) = self.held_map().remove(name) else {
            debug!(name, "release of a lock not held locally");
            return;
        };

        let path = self.lock_path(name);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(name, path = %path.display(), error = %e, "could not remove lock file");
            }
        }

        if let Err((_, errno)) = lock.unlock() {
            warn!(name, %errno, "explicit unlock failed; closing the handle instead");
        }
        debug!(name, "lock released");
    }

    /// Acquire `name` and hand back a guard that releases it on drop.
    pub fn guard(&self, name: &str, timeout: Duration) -> Result<LockGuard<'_>> {
        if self.acquire(name, timeout)? {
            Ok(LockGuard {
                manager: self,
                name: name.to_string(),
            })
        } else {
            Err(LockError::Timeout {
                name: name.to_string(),
                timeout,
            })
        }
    }

    /// Run `f` while holding `name`.
    ///
    /// The lock is released when `f` returns or unwinds.
    pub fn run<T>(&self, name: &str, timeout: Duration, f: impl FnOnce() -> T) -> Result<T> {
        let _guard = self.guard(name, timeout)?;
        Ok(f())
    }

    /// Best-effort probe: true if some other handle holds `name` right now.
    ///
    /// The answer can be stale by the time the caller acts on it.
    pub fn is_locked(&self, name: &str) -> Result<bool> {
        let path = self.lock_path(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            // Dropping the probe handle unlocks it straight away.
            Ok(_probe) => Ok(false),
            Err((_, Errno::EWOULDBLOCK)) => Ok(true),
            Err((_, errno)) => Err(LockError::Io(io::Error::from(errno))),
        }
    }

    /// Whether this manager currently holds `name`.
    pub fn holds(&self, name: &str) -> bool {
        self.held_map().contains_key(name)
    }

    fn held_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Flock<File>>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        let names: Vec<String> = self.held_map().keys().cloned().collect();
        for name in names {
            self.release(&name);
        }
    }
}

/// Holds a named lock until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    name: String,
}

impl LockGuard<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.name);
    }
}

/// Whether `path` still names the file `lock` was taken on.
fn still_linked(lock: &Flock<File>, path: &Path) -> Result<bool> {
    let held = lock.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Record the owning pid in the lock file for operators poking at the dir.
fn write_owner(lock: &Flock<File>) -> Result<()> {
    let mut file: &File = lock;
    file.set_len(0)?;
    file.write_all(std::process::id().to_string().as_bytes())?;
    file.flush()?;
    Ok(())
}
