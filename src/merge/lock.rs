//! One active orchestration per candidate
//!
//! [`CandidateLocks`] guards against two runs in the same process. When a
//! lock directory is configured, [`CandidateFileLock`] adds an advisory file
//! lock so separate processes on the same machine exclude each other too.

use fd_lock::{RwLock, RwLockWriteGuard};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::external::git_host::PullNumber;

/// In-process registry of candidates with an active orchestration
#[derive(Debug, Default, Clone)]
pub struct CandidateLocks {
    held: Arc<Mutex<HashSet<PullNumber>>>,
}

impl CandidateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the candidate is already being orchestrated
    pub fn try_acquire(&self, candidate: PullNumber) -> Option<CandidateGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(candidate) {
            return None;
        }
        debug!(candidate, "Acquired candidate lock");
        Some(CandidateGuard {
            held: self.held.clone(),
            candidate,
        })
    }

    pub fn is_held(&self, candidate: PullNumber) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&candidate)
    }
}

/// Releases the candidate when dropped
#[derive(Debug)]
pub struct CandidateGuard {
    held: Arc<Mutex<HashSet<PullNumber>>>,
    candidate: PullNumber,
}

impl Drop for CandidateGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.candidate);
        debug!(candidate = self.candidate, "Released candidate lock");
    }
}

/// Advisory lock file `<dir>/candidate-<id>.lock`
#[derive(Debug)]
pub struct CandidateFileLock {
    lock: RwLock<File>,
    path: PathBuf,
}

impl CandidateFileLock {
    pub fn open(dir: &Path, candidate: PullNumber) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("candidate-{candidate}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        Ok(Self {
            lock: RwLock::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when another process holds the lock
    pub fn try_lock(&mut self) -> io::Result<Option<RwLockWriteGuard<'_, File>>> {
        match self.lock.try_write() {
            Ok(mut guard) => {
                guard.set_len(0)?;
                writeln!(guard, "{}", lock_owner())?;
                Ok(Some(guard))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// `host:pid` written into held lock files for whoever finds them
fn lock_owner() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{host}:{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let locks = CandidateLocks::new();
        let guard = locks.try_acquire(7).unwrap();
        assert!(locks.try_acquire(7).is_none());
        assert!(locks.try_acquire(8).is_some());
        assert!(locks.is_held(7));

        drop(guard);
        assert!(!locks.is_held(7));
        assert!(locks.try_acquire(7).is_some());
    }

    #[test]
    fn test_file_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = CandidateFileLock::open(dir.path(), 9).unwrap();
        let mut second = CandidateFileLock::open(dir.path(), 9).unwrap();

        let guard = first.try_lock().unwrap();
        assert!(guard.is_some());
        assert!(second.try_lock().unwrap().is_none());

        drop(guard);
        assert!(second.try_lock().unwrap().is_some());

        let owner = std::fs::read_to_string(second.path()).unwrap();
        assert!(owner.trim_end().ends_with(&format!(":{}", std::process::id())));
    }
}
