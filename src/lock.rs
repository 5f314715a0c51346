//! Lock files on the state directory.
//!
//! [`ProcessLock`] keeps a second scanner off a root directory for the life
//! of the process. [`WriteLock`] serializes short read-modify-write updates
//! of one state file between processes, so a CLI can create requests while
//! the scanner is running.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Lock file name inside the root directory.
pub const LOCK_FILE: &str = "paygate.lock";

/// A write lock older than this was left by a crashed process.
pub const STALE_WRITE_LOCK: Duration = Duration::from_secs(30);

const WRITE_LOCK_RETRY: Duration = Duration::from_millis(10);

/// Exclusive claim on a root directory, released on drop.
///
/// A crashed process leaves the file behind; remove it by hand once no
/// other instance is running.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Claim `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Locked`] if another process holds the lock.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                return Err(Error::Locked(format!(
                    "{} is held by pid {}",
                    path.display(),
                    holder.trim()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!("Acquired {}", path.display());
        Ok(Self { path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release {}: {e}", self.path.display());
        }
    }
}

/// Short-lived exclusive claim on one state file, released on drop.
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    /// Claim `path`, waiting up to `wait` for the current holder.
    ///
    /// A lock file older than [`STALE_WRITE_LOCK`] is removed and the claim
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Locked`] if the lock is still held after `wait`.
    pub fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            if is_stale(path) {
                warn!("Breaking stale write lock {}", path.display());
                match std::fs::remove_file(path) {
                    Ok(()) => continue,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Locked(format!(
                    "{} still held after {}ms",
                    path.display(),
                    wait.as_millis()
                )));
            }
            std::thread::sleep(WRITE_LOCK_RETRY);
        }
    }
}

fn is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_WRITE_LOCK)
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release {}: {e}", self.path.display());
        }
    }
}
