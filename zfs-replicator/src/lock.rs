//! Run-level lock so two replication runs never share the relay port.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::utils::errors::{ReplicationError, Result};

/// Exclusive `flock` on a lock file, released on drop.
pub struct RunLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting; fails with `AlreadyRunning` if another
    /// process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(ReplicationError::AlreadyRunning(path.to_path_buf()))
            }
            Err((_, errno)) => return Err(ReplicationError::Io(errno.into())),
        };

        lock.set_len(0)?;
        writeln!(&mut *lock, "{}", std::process::id())?;

        tracing::debug!(path = %path.display(), "Run lock acquired");
        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_run_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zfs-replicate.lock");

        let first = RunLock::acquire(&path).unwrap();
        assert_eq!(first.path(), path.as_path());

        let err = RunLock::acquire(&path).err().expect("lock must be exclusive");
        assert!(matches!(err, ReplicationError::AlreadyRunning(_)));

        drop(first);
        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_lock_file_records_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zfs-replicate.lock");

        let _lock = RunLock::acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
