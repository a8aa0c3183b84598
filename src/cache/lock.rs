//! Cross-process advisory file locks
//!
//! Locks are taken on a dedicated lock file with `flock`-style semantics,
//! so two handles conflict even inside the same process. Acquisition polls
//! instead of blocking a runtime thread, which also keeps it cancel-safe.

use crate::error::{CacheError, CacheResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// A lock file that can be acquired exclusively
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl FileLock {
    /// Create a lock on `path` (the file is created on first acquisition)
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            poll_interval,
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting up to the configured timeout
    pub async fn acquire(&self) -> CacheResult<LockGuard> {
        let file = self.open()?;
        // A timeout too large to represent waits forever
        let deadline = Instant::now().checked_add(self.timeout);

        loop {
            match try_lock(&file) {
                Ok(true) => {
                    debug!("Acquired lock {}", self.path.display());
                    return Ok(LockGuard {
                        file,
                        path: self.path.clone(),
                    });
                }
                Ok(false) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(CacheError::lock(
                            &self.path,
                            format!("timed out after {:?}", self.timeout),
                        ));
                    }
                    trace!("Lock {} is busy, waiting", self.path.display());
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(CacheError::lock(&self.path, e.to_string())),
            }
        }
    }

    /// Acquire the lock only if nobody else holds it
    pub fn try_acquire(&self) -> CacheResult<Option<LockGuard>> {
        let file = self.open()?;
        match try_lock(&file) {
            Ok(true) => Ok(Some(LockGuard {
                file,
                path: self.path.clone(),
            })),
            Ok(false) => Ok(None),
            Err(e) => Err(CacheError::lock(&self.path, e.to_string())),
        }
    }

    fn open(&self) -> CacheResult<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::lock(&self.path, e.to_string()))?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| CacheError::lock(&self.path, e.to_string()))
    }
}

/// Held lock; released when dropped
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Path of the held lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to unlock {}: {}", self.path.display(), e);
        } else {
            debug!("Released lock {}", self.path.display());
        }
    }
}

/// `Ok(false)` when another handle holds the lock
fn try_lock(file: &File) -> io::Result<bool> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(e) if is_contended(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
