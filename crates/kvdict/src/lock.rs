//! Advisory locking discipline.
//!
//! The engine is opened without internal locking, so the adapter serializes
//! access itself: every read takes a shared lock and every write takes an
//! exclusive lock on the database file, held for exactly one operation.
//! Locks are `flock(2)` locks on the handle's own open file description,
//! so two handles on the same file exclude each other even inside one
//! process. Acquisition blocks until granted; there is no timeout.

use std::io;
use std::os::unix::io::RawFd;

use tracing::error;

/// Lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of holders.
    Shared,
    /// Single holder; waits for all shared holders to leave.
    Exclusive,
}

impl LockMode {
    const fn operation(self) -> libc::c_int {
        match self {
            Self::Shared => libc::LOCK_SH,
            Self::Exclusive => libc::LOCK_EX,
        }
    }
}

#[allow(unsafe_code)]
fn flock(fd: RawFd, operation: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: flock only reads the descriptor number; an invalid
        // descriptor is reported as EBADF.
        if unsafe { libc::flock(fd, operation) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Acquire (or convert to) a lock on `fd`, blocking until granted.
pub fn lock_fd(fd: RawFd, mode: LockMode) -> io::Result<()> {
    flock(fd, mode.operation())
}

/// Release any lock held on `fd`.
pub fn unlock_fd(fd: RawFd) -> io::Result<()> {
    flock(fd, libc::LOCK_UN)
}

/// A lock held for the duration of one operation.
///
/// Release it with [`LockGuard::release`] to observe unlock failures. A
/// guard that is dropped instead (early return, panic) still unlocks and
/// logs any failure.
#[derive(Debug)]
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard {
    fd: Option<RawFd>,
}

impl LockGuard {
    /// Lock `fd` in `mode`. With `enabled == false` nothing is locked and
    /// the guard is inert.
    pub fn acquire(fd: RawFd, mode: LockMode, enabled: bool) -> io::Result<Self> {
        if !enabled {
            return Ok(Self { fd: None });
        }
        lock_fd(fd, mode)?;
        Ok(Self { fd: Some(fd) })
    }

    /// Whether a lock is actually held.
    pub const fn is_held(&self) -> bool {
        self.fd.is_some()
    }

    /// Release the lock.
    pub fn release(mut self) -> io::Result<()> {
        match self.fd.take() {
            Some(fd) => unlock_fd(fd),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take()
            && let Err(e) = unlock_fd(fd)
        {
            error!("unlock fd {fd}: {e}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use std::sync::mpsc;
    use std::time::Duration;

    #[allow(unsafe_code)]
    fn try_lock(fd: RawFd, mode: LockMode) -> bool {
        // SAFETY: see `flock`.
        unsafe { libc::flock(fd, mode.operation() | libc::LOCK_NB) == 0 }
    }

    fn two_handles() -> (tempfile::TempDir, File, File) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lock.mdb");
        std::fs::write(&path, b"").expect("write");
        let a = File::open(&path).expect("open a");
        let b = File::open(&path).expect("open b");
        (dir, a, b)
    }

    #[test]
    fn test_shared_holders_coexist() {
        let (_dir, a, b) = two_handles();
        let guard_a = LockGuard::acquire(a.as_raw_fd(), LockMode::Shared, true).expect("a");
        let guard_b = LockGuard::acquire(b.as_raw_fd(), LockMode::Shared, true).expect("b");
        assert!(guard_a.is_held() && guard_b.is_held());
        guard_a.release().expect("release a");
        guard_b.release().expect("release b");
    }

    #[test]
    fn test_exclusive_conflicts_with_shared() {
        let (_dir, a, b) = two_handles();
        let guard = LockGuard::acquire(a.as_raw_fd(), LockMode::Shared, true).expect("a");
        assert!(!try_lock(b.as_raw_fd(), LockMode::Exclusive));
        guard.release().expect("release");
        assert!(try_lock(b.as_raw_fd(), LockMode::Exclusive));
        assert!(!try_lock(a.as_raw_fd(), LockMode::Shared));
    }

    #[test]
    fn test_exclusive_waits_for_shared_release() {
        let (_dir, a, b) = two_handles();
        let guard = LockGuard::acquire(a.as_raw_fd(), LockMode::Shared, true).expect("a");

        let (tx, rx) = mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let exclusive =
                LockGuard::acquire(b.as_raw_fd(), LockMode::Exclusive, true).expect("b");
            tx.send(()).expect("send");
            exclusive.release().expect("release b");
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        guard.release().expect("release a");
        rx.recv_timeout(Duration::from_secs(10))
            .expect("exclusive granted after release");
        waiter.join().expect("join");
    }

    #[test]
    fn test_drop_releases() {
        let (_dir, a, b) = two_handles();
        {
            let _guard =
                LockGuard::acquire(a.as_raw_fd(), LockMode::Exclusive, true).expect("a");
            assert!(!try_lock(b.as_raw_fd(), LockMode::Shared));
        }
        assert!(try_lock(b.as_raw_fd(), LockMode::Shared));
    }

    #[test]
    fn test_disabled_guard_is_inert() {
        let (_dir, a, b) = two_handles();
        let guard = LockGuard::acquire(a.as_raw_fd(), LockMode::Exclusive, false).expect("a");
        assert!(!guard.is_held());
        assert!(try_lock(b.as_raw_fd(), LockMode::Exclusive));
        guard.release().expect("release");
    }

    #[test]
    fn test_bad_descriptor_is_an_error() {
        assert!(lock_fd(-1, LockMode::Shared).is_err());
    }
}
