//! Per-label exclusive lock.
//!
//! A lock is a `<store>.lock` file created with `create_new`, so only one
//! holder (thread or process) can exist at a time. The file is removed when
//! the guard drops. Locks older than [`STALE_AFTER`] are assumed to belong to
//! a crashed writer and are broken.
//!
//! Breaking renames the stale file to a unique name first. Only the waiter
//! whose rename succeeds deletes it, so two waiters cannot both break the
//! same lock and one of them remove a lock the other just took.

use crate::store::StoreError;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub const STALE_AFTER: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct LabelLock {
    path: PathBuf,
}

impl LabelLock {
    /// Lock path guarding `store_path`.
    pub fn path_for(store_path: &Path) -> PathBuf {
        let mut name = store_path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Block until the lock for `store_path` is held or `timeout` elapses.
    pub fn acquire(store_path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        Self::acquire_with(store_path, timeout, STALE_AFTER)
    }

    /// [`acquire`](Self::acquire) with an explicit stale-lock age.
    pub fn acquire_with(store_path: &Path, timeout: Duration, stale_after: Duration) -> Result<Self, StoreError> {
        let path = Self::path_for(store_path);
        let deadline = Instant::now() + timeout;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, stale_after) && break_stale(&path, stale_after) {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(path));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LabelLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

/// Claim a stale lock file and delete it. Returns `true` when the lock path
/// is worth retrying right away.
fn break_stale(path: &Path, stale_after: Duration) -> bool {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".stale.{}", uuid::Uuid::new_v4().simple()));
    let claimed = PathBuf::from(name);

    // Lost the race: another waiter already moved it away.
    if fs::rename(path, &claimed).is_err() {
        return true;
    }

    // Between the check and the rename the lock may have been broken and
    // retaken. Put a live lock back unless a newer one already exists.
    if !is_stale(&claimed, stale_after) {
        if fs::hard_link(&claimed, path).is_err() {
            tracing::debug!(lock = %path.display(), "live lock replaced while restoring");
        }
        let _ = fs::remove_file(&claimed);
        return false;
    }

    tracing::warn!(lock = %path.display(), "breaking stale store lock");
    let _ = fs::remove_file(&claimed);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_file_lifecycle() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("training_data_wave.npy");

        let lock = LabelLock::acquire(&store, Duration::from_millis(50)).unwrap();
        assert!(lock.path().exists());
        assert!(lock.path().to_string_lossy().ends_with("training_data_wave.npy.lock"));

        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_holder_times_out() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("training_data_wave.npy");

        let _held = LabelLock::acquire(&store, Duration::from_millis(50)).unwrap();
        assert!(matches!(
            LabelLock::acquire(&store, Duration::from_millis(30)),
            Err(StoreError::LockTimeout(_))
        ));
    }

    #[test]
    fn test_released_lock_can_be_reacquired() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("training_data_wave.npy");

        drop(LabelLock::acquire(&store, Duration::from_millis(50)).unwrap());
        assert!(LabelLock::acquire(&store, Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("training_data_wave.npy");
        let path = LabelLock::path_for(&store);
        fs::write(&path, "999999\n").unwrap();
        thread::sleep(Duration::from_millis(30));

        let lock = LabelLock::acquire_with(&store, Duration::from_millis(50), Duration::from_millis(10)).unwrap();
        let owner = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());

        // No claimed leftovers beside the lock itself.
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_fresh_lock_is_not_broken() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("training_data_wave.npy");
        let _held = LabelLock::acquire(&store, Duration::from_millis(50)).unwrap();

        assert!(matches!(
            LabelLock::acquire_with(&store, Duration::from_millis(30), Duration::from_secs(5)),
            Err(StoreError::LockTimeout(_))
        ));
    }

    #[test]
    fn test_waiters_breaking_one_stale_lock_stay_exclusive() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let store = dir.path().join("training_data_wave.npy");
        fs::write(LabelLock::path_for(&store), "999999\n").unwrap();
        thread::sleep(Duration::from_millis(120));

        let holders = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let holders = holders.clone();
                let overlaps = overlaps.clone();
                thread::spawn(move || {
                    let _lock =
                        LabelLock::acquire_with(&store, Duration::from_secs(5), Duration::from_millis(100)).unwrap();
                    if holders.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(2));
                    holders.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(!LabelLock::path_for(&store).exists());
    }
}
