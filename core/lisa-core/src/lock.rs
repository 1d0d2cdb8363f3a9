//! Advisory file locks with timeout.
//!
//! Locks are taken on a sibling `<path>.lock` file with `flock(2)` in
//! non-blocking mode, retrying every 10ms until the timeout elapses. The lock
//! is released when the guard (and its file descriptor) is dropped.
//!
//! # Modes
//!
//! - **Shared**: read-only access (event tail, registry reads).
//! - **Exclusive**: any mutation (event append + trim, registry write).

use crate::error::{LisaError, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Held lock. Unlocks on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    waited_ms: u64,
}

impl FileLockGuard {
    pub fn waited_ms(&self) -> u64 {
        self.waited_ms
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

/// Sibling lock path: `events.jsonl` -> `events.jsonl.lock`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Acquires `lock_path` in `mode`, failing with [`LisaError::LockTimeout`]
/// labelled `label` after `timeout_ms`.
pub fn acquire(
    lock_path: &Path,
    mode: LockMode,
    timeout_ms: u64,
    label: &'static str,
) -> Result<FileLockGuard> {
    if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| LisaError::io(format!("create {}", parent.display()), e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| LisaError::io(format!("open lock {}", lock_path.display()), e))?;

    let start = Instant::now();
    loop {
        match try_lock(&file, mode) {
            Ok(true) => {
                let waited_ms = start.elapsed().as_millis() as u64;
                if waited_ms > 0 {
                    debug!(lock = %lock_path.display(), waited_ms, "lock acquired after wait");
                }
                return Ok(FileLockGuard { file, waited_ms });
            }
            Ok(false) => {
                let waited_ms = start.elapsed().as_millis() as u64;
                if waited_ms >= timeout_ms {
                    return Err(LisaError::LockTimeout { label, waited_ms });
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(LisaError::io(format!("flock {}", lock_path.display()), e));
            }
        }
    }
}

/// Runs `f` while holding an exclusive lock on `<path>.lock`.
pub fn with_exclusive_lock<T>(
    path: &Path,
    timeout_ms: u64,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let _guard = acquire(&lock_path_for(path), LockMode::Exclusive, timeout_ms, "event lock")?;
    f()
}

/// Runs `f` while holding a shared lock on `<path>.lock`.
pub fn with_shared_lock<T>(
    path: &Path,
    timeout_ms: u64,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let _guard = acquire(
        &lock_path_for(path),
        LockMode::Shared,
        timeout_ms,
        "event read lock",
    )?;
    f()
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(false),
        Some(code) if code == libc::EINTR => Ok(false),
        _ => Err(err),
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File, _mode: LockMode) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_is_sibling() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/a/events.jsonl")),
            PathBuf::from("/tmp/a/events.jsonl.lock")
        );
    }

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("store.json");
        let lock = lock_path_for(&target);
        let _held = acquire(&lock, LockMode::Exclusive, 100, "event lock").unwrap();

        let err = acquire(&lock, LockMode::Exclusive, 50, "state lock").unwrap_err();
        match err {
            LisaError::LockTimeout { label, waited_ms } => {
                assert_eq!(label, "state lock");
                assert!(waited_ms >= 50);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_shared_locks_coexist_but_block_exclusive() {
        let tmp = TempDir::new().unwrap();
        let lock = tmp.path().join("x.lock");
        let _a = acquire(&lock, LockMode::Shared, 100, "event read lock").unwrap();
        let _b = acquire(&lock, LockMode::Shared, 100, "event read lock").unwrap();
        assert!(acquire(&lock, LockMode::Exclusive, 30, "event lock").is_err());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let lock = tmp.path().join("y.lock");
        {
            let _held = acquire(&lock, LockMode::Exclusive, 100, "event lock").unwrap();
        }
        assert!(acquire(&lock, LockMode::Exclusive, 10, "event lock").is_ok());
    }

    #[test]
    fn test_exclusive_sections_do_not_overlap() {
        let tmp = TempDir::new().unwrap();
        let target = Arc::new(tmp.path().join("counter.txt"));
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let target = Arc::clone(&target);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    with_exclusive_lock(&target, 5000, || {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
