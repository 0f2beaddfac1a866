//! Client-side per-filename transfer lock (spec.md §4.5).
//!
//! Advisory only: a sidecar `<name>.lock` marker file, created on acquire
//! and removed on release (or on `Drop`, so an early return or panic still
//! cleans up). Does not guard against another process bypassing the
//! convention.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("a transfer for {0:?} is already in progress")]
    AlreadyHeld(PathBuf),
    #[error("could not create lock marker {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// RAII guard for a single filename's transfer lock.
pub struct FileLock {
    marker: PathBuf,
}

impl FileLock {
    /// Acquire the lock for `filename`, optionally recording the peer this
    /// transfer is with inside the marker file.
    pub fn acquire(filename: &Path, peer: Option<SocketAddr>) -> Result<Self, LockError> {
        let marker = lock_path(filename);
        if marker.exists() {
            return Err(LockError::AlreadyHeld(filename.to_path_buf()));
        }
        let contents = peer.map(|p| p.to_string()).unwrap_or_default();
        std::fs::write(&marker, contents).map_err(|source| LockError::Io {
            path: marker.clone(),
            source,
        })?;
        Ok(Self { marker })
    }

    /// Release the lock. Idempotent: a marker that's already gone is not an error.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.marker);
    }
}

fn lock_path(filename: &Path) -> PathBuf {
    let mut name = filename.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    /// Distinct scratch filename per test so the marker files in the test
    /// binary's working directory never collide across parallel tests.
    fn scratch_name() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        PathBuf::from(format!("tftpd-rs-test-lock-{}-{n}", std::process::id()))
    }

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let name = scratch_name();
        let lock = FileLock::acquire(&name, None).unwrap();
        assert!(lock_path(&name).exists());
        lock.release();
        assert!(!lock_path(&name).exists());

        let lock2 = FileLock::acquire(&name, None).unwrap();
        drop(lock2);
    }

    #[test]
    fn concurrent_acquire_is_rejected() {
        let name = scratch_name();
        let first = FileLock::acquire(&name, None).unwrap();
        match FileLock::acquire(&name, None) {
            Err(LockError::AlreadyHeld(_)) => {}
            _ => panic!("expected AlreadyHeld"),
        }
        drop(first);
    }

    #[test]
    fn drop_releases_even_without_explicit_release() {
        let name = scratch_name();
        {
            let _lock = FileLock::acquire(&name, None).unwrap();
            assert!(lock_path(&name).exists());
        }
        assert!(!lock_path(&name).exists());
    }

    #[test]
    fn marker_records_peer_when_given() {
        let name = scratch_name();
        let peer: SocketAddr = "127.0.0.1:6969".parse().unwrap();
        let lock = FileLock::acquire(&name, Some(peer)).unwrap();
        let contents = std::fs::read_to_string(lock_path(&name)).unwrap();
        assert_eq!(contents, "127.0.0.1:6969");
        drop(lock);
    }
}
