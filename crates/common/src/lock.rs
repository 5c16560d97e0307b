//! Scoped exclusive locks keyed by file identity
//!
//! Every read-modify-write against a shared file (confirmation maps,
//! stylesheets, the knowledge base, baseline artifacts) holds the guard for
//! that file from the read to the write. Guards release on drop, including
//! on error paths.
//!
//! A registry built with [`FileLocks::with_lock_dir`] also takes an advisory
//! `flock` on a lock file per identity, so separate processes sharing the
//! same lock directory exclude each other too. The lock file lives in the
//! lock directory rather than next to the target because atomic writes
//! replace the target inode.

use crate::{Error, Result};
use dashmap::DashMap;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

const LOCK_RETRY_MS: u64 = 25;
const LOCK_TIMEOUT_SECS: u64 = 120;

/// Registry of per-file locks
#[derive(Debug, Clone, Default)]
pub struct FileLocks {
    inner: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
    lock_dir: Option<PathBuf>,
}

/// Held lock on one file identity
#[derive(Debug)]
pub struct FileGuard {
    path: PathBuf,
    advisory: Option<File>,
    _guard: OwnedMutexGuard<()>,
}

impl FileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether another process is excluded as well
    pub fn is_shared(&self) -> bool {
        self.advisory.is_some()
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        if let Some(file) = self.advisory.take() {
            let _ = FileExt::unlock(&file);
        }
        trace!("Released lock on {}", self.path.display());
    }
}

impl FileLocks {
    /// In-process locks only
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks that also exclude other processes using the same `lock_dir`
    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::default(),
            lock_dir: Some(lock_dir.into()),
        }
    }

    pub fn lock_dir(&self) -> Option<&Path> {
        self.lock_dir.as_deref()
    }

    fn mutex_for(&self, key: &Path) -> Arc<Mutex<()>> {
        self.inner
            .entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn lock_file_for(&self, key: &Path) -> Option<PathBuf> {
        let dir = self.lock_dir.as_ref()?;
        let digest = Sha256::digest(key.to_string_lossy().as_bytes());
        Some(dir.join(format!("{}.lock", &hex::encode(digest)[..32])))
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io(path, e))
    }

    async fn acquire_advisory(&self, key: &Path) -> Result<Option<File>> {
        let Some(lock_path) = self.lock_file_for(key) else {
            return Ok(None);
        };
        let file = Self::open_lock_file(&lock_path)?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock || is_contended(&e) => {
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(Error::io(
                            &lock_path,
                            std::io::Error::new(
                                ErrorKind::TimedOut,
                                format!(
                                    "timed out waiting for lock on {} ({}s)",
                                    key.display(),
                                    LOCK_TIMEOUT_SECS
                                ),
                            ),
                        ));
                    }
                    tokio::time::sleep(Duration::from_millis(LOCK_RETRY_MS)).await;
                }
                Err(e) => return Err(Error::io(&lock_path, e)),
            }
        }

        debug!("Acquired advisory lock {} for {}", lock_path.display(), key.display());
        Ok(Some(file))
    }

    /// Wait for exclusive access to `path`
    pub async fn lock(&self, path: impl AsRef<Path>) -> Result<FileGuard> {
        let key = crate::fs::identity(path);
        let mutex = self.mutex_for(&key);
        let guard = mutex.lock_owned().await;
        let advisory = self.acquire_advisory(&key).await?;
        trace!("Acquired lock on {}", key.display());
        Ok(FileGuard {
            path: key,
            advisory,
            _guard: guard,
        })
    }

    /// Take the lock only if nobody, in this process or another, holds it
    pub fn try_lock(&self, path: impl AsRef<Path>) -> Option<FileGuard> {
        let key = crate::fs::identity(path);
        let mutex = self.mutex_for(&key);
        let guard = mutex.try_lock_owned().ok()?;
        let advisory = match self.lock_file_for(&key) {
            Some(lock_path) => {
                let file = Self::open_lock_file(&lock_path).ok()?;
                FileExt::try_lock_exclusive(&file).ok()?;
                Some(file)
            }
            None => None,
        };
        Some(FileGuard {
            path: key,
            advisory,
            _guard: guard,
        })
    }

    /// Lock several files. Acquisition follows identity order so two callers
    /// locking overlapping sets cannot deadlock.
    pub async fn lock_all<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<FileGuard>> {
        let mut keys: Vec<PathBuf> = paths.iter().map(crate::fs::identity).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await?);
        }
        Ok(guards)
    }

    /// Whether this process holds the lock for `path`
    pub fn is_locked(&self, path: impl AsRef<Path>) -> bool {
        let key = crate::fs::identity(path);
        self.inner
            .get(&key)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    // fs2 reports a held lock as its own error kind on some platforms
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("styles.css");
        let locks = FileLocks::new();

        let guard = locks.lock(&path).await.unwrap();
        assert!(!guard.is_shared());
        assert!(locks.is_locked(&path));
        assert!(locks.try_lock(&path).is_none());

        let waiter = {
            let locks = locks.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&path).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!locks.is_locked(&path));
    }

    #[tokio::test]
    async fn test_lock_all_dedups_same_identity() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.json");
        std::fs::write(&a, b"{}").unwrap();
        let relative_twin = tmp.path().join(".").join("a.json");
        let locks = FileLocks::new();

        let guards = locks
            .lock_all(&[a.clone(), relative_twin, tmp.path().join("b.json")])
            .await
            .unwrap();
        assert_eq!(guards.len(), 2);
        assert!(locks.is_locked(&a));
    }

    #[tokio::test]
    async fn test_separate_registries_share_lock_dir() {
        // Two registries stand in for two processes: each has its own
        // in-process mutexes, so only the advisory lock can exclude.
        let tmp = TempDir::new().unwrap();
        let lock_dir = tmp.path().join("locks");
        let path = tmp.path().join("pending.json");
        let first = FileLocks::with_lock_dir(&lock_dir);
        let second = FileLocks::with_lock_dir(&lock_dir);

        let guard = first.lock(&path).await.unwrap();
        assert!(guard.is_shared());
        assert!(second.try_lock(&path).is_none());

        let waiter = {
            let second = second.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let _g = second.lock(&path).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(second.try_lock(&path).is_some());
    }

    #[tokio::test]
    async fn test_unrelated_files_do_not_contend() {
        let tmp = TempDir::new().unwrap();
        let lock_dir = tmp.path().join("locks");
        let first = FileLocks::with_lock_dir(&lock_dir);
        let second = FileLocks::with_lock_dir(&lock_dir);

        let _a = first.lock(tmp.path().join("a.css")).await.unwrap();
        assert!(second.try_lock(tmp.path().join("b.css")).is_some());
    }
}
