//! The single-writer repository lock.
//!
//! One advisory flock on `<repo>/bunsen.lock` serializes all mutation
//! across processes. Readers never take it. The lock is held for the
//! duration of one ingest or maintenance call and released (and the file
//! removed) on drop, including on panic unwind.

use std::fs::File;
use std::path::{Path, PathBuf};

use rustix::fs::FlockOperation;

use crate::errors::BunsenError;

/// File name of the lock inside a repository.
pub const LOCK_FILE: &str = "bunsen.lock";

/// An acquired write lock. Dropping releases it.
pub struct WriteLock {
    path: PathBuf,
    file: File,
}

impl WriteLock {
    /// Acquire the lock, blocking until the current holder releases it.
    pub fn acquire(path: &Path) -> Result<WriteLock, BunsenError> {
        loop {
            let file = File::create(path)?;
            rustix::fs::flock(&file, FlockOperation::LockExclusive)
                .map_err(std::io::Error::from)?;
            // The previous holder may have unlinked the file between our
            // open and our lock; retry on a fresh inode so our ownership
            // stays visible on disk.
            let stat = rustix::fs::fstat(&file).map_err(std::io::Error::from)?;
            if stat.st_nlink == 0 {
                continue;
            }
            return Ok(WriteLock {
                path: path.to_path_buf(),
                file,
            });
        }
    }

    /// Acquire the lock without blocking; `LockHeld` when another writer
    /// has it.
    pub fn try_acquire(path: &Path) -> Result<WriteLock, BunsenError> {
        loop {
            let file = File::create(path)?;
            match rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => {}
                Err(e) if e == rustix::io::Errno::WOULDBLOCK => {
                    return Err(BunsenError::LockHeld(path.display().to_string()));
                }
                Err(e) => return Err(BunsenError::StoreIo(e.into())),
            }
            let stat = rustix::fs::fstat(&file).map_err(std::io::Error::from)?;
            if stat.st_nlink == 0 {
                continue;
            }
            return Ok(WriteLock {
                path: path.to_path_buf(),
                file,
            });
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        // Removing the file is cosmetic; waiters create a fresh one.
        _ = std::fs::remove_file(&self.path);
        _ = rustix::fs::flock(&self.file, FlockOperation::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The lock excludes a second non-blocking acquirer until dropped.
    #[test]
    fn test_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        let held = WriteLock::acquire(&path).unwrap();
        match WriteLock::try_acquire(&path) {
            Err(BunsenError::LockHeld(_)) => {}
            other => panic!("expected LockHeld, got {:?}", other.map(|_| ())),
        }
        drop(held);
        WriteLock::try_acquire(&path).unwrap();
    }

    /// Dropping the lock removes the file.
    #[test]
    fn test_drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        let held = WriteLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(held);
        assert!(!path.exists());
    }
}
