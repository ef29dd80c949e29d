//! Exclusive update lock keyed by storage directory.
//!
//! The lock is an OS advisory lock (`flock`/`LockFileEx` through `fs2`) on
//! a lock file in the storage directory. The kernel releases it when the
//! holder closes the file or dies, so a crashed update never leaves the
//! index locked and a long-running one is never mistaken for abandoned.
//!
//! The file itself stays on disk between updates. Its contents (pid and
//! acquisition time of the current holder) are informational only.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IndexError, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// How long to wait for a held lock. Zero fails immediately.
    pub timeout: Duration,
}

/// Held update lock. Released on drop.
#[derive(Debug)]
pub struct IndexLock {
    file: File,
    path: PathBuf,
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == io::ErrorKind::WouldBlock
}

impl IndexLock {
    /// Acquire the lock at `path`, waiting up to `options.timeout`.
    pub async fn acquire(path: &Path, options: LockOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + options.timeout;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        let dir = path.parent().unwrap_or(path).to_path_buf();
                        return Err(IndexError::IndexBusy(dir));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let lock = Self {
            file,
            path: path.to_path_buf(),
        };
        if let Err(e) = lock.write_record() {
            warn!(path = %path.display(), error = %e, "failed to record index lock holder");
        }
        debug!(path = %path.display(), "acquired index lock");
        Ok(lock)
    }

    fn write_record(&self) -> Result<()> {
        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: Utc::now().to_rfc3339(),
        };
        self.file.set_len(0)?;
        (&self.file).write_all(&serde_json::to_vec(&record)?)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release index lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");

        let held = IndexLock::acquire(&path, LockOptions::default()).await.unwrap();
        let err = IndexLock::acquire(&path, LockOptions::default()).await.unwrap_err();
        assert!(matches!(err, IndexError::IndexBusy(_)));

        drop(held);
        IndexLock::acquire(&path, LockOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        let held = IndexLock::acquire(&path, LockOptions::default()).await.unwrap();

        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move {
            let options = LockOptions {
                timeout: Duration::from_secs(5),
            };
            IndexLock::acquire(&waiter_path, options).await.map(|_| ())
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn long_held_lock_is_never_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        let held = IndexLock::acquire(&path, LockOptions::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let options = LockOptions {
            timeout: Duration::from_millis(100),
        };
        let err = IndexLock::acquire(&path, options).await.unwrap_err();
        assert!(matches!(err, IndexError::IndexBusy(_)));
        assert_eq!(held.path(), path.as_path());
    }

    #[tokio::test]
    async fn leftover_lock_file_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        fs::write(&path, b"{\"pid\":1,\"acquired_at\":\"2020-01-01T00:00:00Z\"}").unwrap();

        let lock = IndexLock::acquire(&path, LockOptions::default()).await.unwrap();
        let record: LockRecord = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(record.pid, std::process::id());
        drop(lock);
        assert!(path.exists());
    }
}
