//! Advisory, non-blocking locks guarding the "exists, compute, persist"
//! window of a single artifact.
//!
//! A file lock is a marker file placed next to the artifact it protects
//! (`<artifact>.lock`). Acquisition creates the marker atomically and fails
//! immediately if it is already there; there is no waiting. The marker holds
//! the id of the process that created it, which is useful to operators when a
//! crashed process leaves a stale marker behind: such a marker blocks every
//! future acquisition until it is removed, see [`Lock::purge`].
//!
//! Next to the pid, every marker carries a token unique to the [`Lock`] that
//! wrote it. Releasing only removes a marker bearing the releasing lock's own
//! token, so a holder whose marker was purged never deletes the marker of
//! whoever acquired the lock next.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::LockError;

/// Keys held by in-process locks, with the token of their holder, shared by
/// everyone contending for the same storage.
pub(crate) type HeldKeys = Arc<Mutex<HashMap<String, String>>>;

enum Marker {
    /// Nothing to contend for.
    None,
    /// Marker file on disk.
    File(Utf8PathBuf),
    /// Marker key in a set shared within the process.
    Memory { held: HeldKeys, key: String },
}

/// Exclusive lock scoped to one artifact. Dropping a held lock releases it.
pub struct Lock {
    marker: Marker,
    token: String,
    held: bool,
}

impl Lock {
    /// A lock that never contends, for storage that persists nothing.
    pub fn none() -> Self {
        Self::with_marker(Marker::None)
    }

    /// A lock protecting the file at `artifact`, using a sibling marker file.
    pub fn file(artifact: impl AsRef<Utf8Path>) -> Self {
        let artifact = artifact.as_ref();
        let marker = Utf8PathBuf::from(format!("{artifact}.lock"));

        Self::with_marker(Marker::File(marker))
    }

    pub(crate) fn memory(held: HeldKeys, key: impl Into<String>) -> Self {
        Self::with_marker(Marker::Memory {
            held,
            key: key.into(),
        })
    }

    fn with_marker(marker: Marker) -> Self {
        Self {
            marker,
            token: uuid::Uuid::new_v4().simple().to_string(),
            held: false,
        }
    }

    /// Path of the marker file, if this is a file lock.
    pub fn marker(&self) -> Option<&Utf8Path> {
        match &self.marker {
            Marker::File(path) => Some(path),
            _ => None,
        }
    }

    /// True if this instance currently owns the lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// True if nobody holds the lock right now. The answer may be stale by
    /// the time it is read.
    pub fn is_available(&self) -> bool {
        match &self.marker {
            Marker::None => !self.held,
            Marker::File(path) => !path.exists(),
            Marker::Memory { held, key } => {
                !held
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains_key(key)
            }
        }
    }

    /// Tries to take the lock without waiting.
    pub fn acquire(&mut self) -> Result<(), LockError> {
        if self.held {
            return Err(LockError::Held(self.label()));
        }

        match &self.marker {
            Marker::None => {}
            Marker::File(path) => acquire_file(path, &self.token)?,
            Marker::Memory { held, key } => {
                let mut held = held.lock().unwrap_or_else(PoisonError::into_inner);
                if held.contains_key(key) {
                    return Err(LockError::Held(Utf8PathBuf::from(key)));
                }
                held.insert(key.clone(), self.token.clone());
            }
        }

        self.held = true;
        Ok(())
    }

    /// Gives the lock back. Calling this on a lock that isn't held, or whose
    /// marker has already disappeared or been taken over by another holder,
    /// leaves the marker alone.
    pub fn release(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        match &self.marker {
            Marker::None => Ok(()),
            Marker::File(path) => match read_marker(path)? {
                Some((_, token)) if token == self.token => remove_marker(path).map(|_| ()),
                Some(_) => {
                    tracing::warn!("lock {path} was taken over by another holder, leaving it");
                    Ok(())
                }
                None => Ok(()),
            },
            Marker::Memory { held, key } => {
                let mut held = held.lock().unwrap_or_else(PoisonError::into_inner);
                if held.get(key) == Some(&self.token) {
                    held.remove(key);
                }
                Ok(())
            }
        }
    }

    /// Acquires the lock and returns a guard releasing it when dropped.
    pub fn scoped(mut self) -> Result<LockGuard, LockError> {
        self.acquire()?;
        Ok(LockGuard { lock: self })
    }

    /// Process id recorded in the marker file by whoever holds it.
    pub fn holder(&self) -> Option<u32> {
        match &self.marker {
            Marker::File(path) => read_marker(path).ok()??.0,
            _ => None,
        }
    }

    /// Removes the marker regardless of who owns it. Meant for clearing the
    /// leftovers of a crashed holder, never for normal operation. Returns
    /// whether there was anything to remove.
    pub fn purge(&mut self) -> Result<bool, LockError> {
        self.held = false;

        match &self.marker {
            Marker::None => Ok(false),
            Marker::File(path) => remove_marker(path),
            Marker::Memory { held, key } => Ok(held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key)
                .is_some()),
        }
    }

    fn label(&self) -> Utf8PathBuf {
        match &self.marker {
            Marker::None => Utf8PathBuf::new(),
            Marker::File(path) => path.clone(),
            Marker::Memory { key, .. } => Utf8PathBuf::from(key),
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!("failed to release lock: {err}");
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("marker", &self.label())
            .field("held", &self.held)
            .finish()
    }
}

/// A held [`Lock`]. The lock is released when the guard goes out of scope,
/// whichever way that happens.
#[derive(Debug)]
pub struct LockGuard {
    lock: Lock,
}

impl LockGuard {
    /// Releases the lock early.
    pub fn release(mut self) -> Result<(), LockError> {
        self.lock.release()
    }

    pub fn marker(&self) -> Option<&Utf8Path> {
        self.lock.marker()
    }
}

fn acquire_file(path: &Utf8Path, token: &str) -> Result<(), LockError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(LockError::Held(path.to_owned()));
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(LockError::Unavailable(path.to_owned()));
        }
        Err(err) => return Err(LockError::Io(path.to_owned(), err)),
    };

    if let Err(err) = writeln!(file, "{} {token}", std::process::id()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(LockError::Io(path.to_owned(), err));
    }

    Ok(())
}

/// Pid and token recorded in the marker, `None` if there is no marker.
/// Markers written by hand may lack either part.
fn read_marker(path: &Utf8Path) -> Result<Option<(Option<u32>, String)>, LockError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(LockError::Io(path.to_owned(), err)),
    };

    let mut parts = text.split_whitespace();
    let pid = parts.next().and_then(|pid| pid.parse().ok());
    let token = parts.next().unwrap_or_default().to_string();

    Ok(Some((pid, token)))
}

fn remove_marker(path: &Utf8Path) -> Result<bool, LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(LockError::Io(path.to_owned(), err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("artifact.json")).unwrap();
        (dir, path)
    }

    #[test]
    fn test_second_holder_is_rejected() {
        let (_dir, path) = scratch();

        let mut first = Lock::file(&path);
        let mut second = Lock::file(&path);

        first.acquire().unwrap();
        assert!(matches!(second.acquire(), Err(LockError::Held(_))));
        assert!(!second.is_held());

        first.release().unwrap();
        second.acquire().unwrap();
        assert!(second.is_held());
    }

    #[test]
    fn test_marker_is_a_sibling() {
        let (_dir, path) = scratch();
        let lock = Lock::file(&path);
        assert_eq!(lock.marker().unwrap(), format!("{path}.lock"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let (_dir, path) = scratch();
        let mut lock = Lock::file(&path);

        lock.acquire().unwrap();
        lock.release().unwrap();
        lock.release().unwrap();
        assert!(lock.is_available());
    }

    #[test]
    fn test_missing_parent_is_unavailable() {
        let (_dir, path) = scratch();
        let path = path.parent().unwrap().join("missing/artifact.json");

        let mut lock = Lock::file(&path);
        assert!(matches!(lock.acquire(), Err(LockError::Unavailable(_))));
    }

    #[test]
    fn test_guard_releases_on_error_path() {
        let (_dir, path) = scratch();

        let failing = || -> Result<(), anyhow::Error> {
            let _guard = Lock::file(&path).scoped()?;
            anyhow::bail!("computation failed");
        };

        assert!(failing().is_err());
        assert!(Lock::file(&path).is_available());
    }

    #[test]
    fn test_marker_records_holder() {
        let (_dir, path) = scratch();
        let guard = Lock::file(&path).scoped().unwrap();

        assert_eq!(Lock::file(&path).holder(), Some(std::process::id()));
        guard.release().unwrap();
        assert_eq!(Lock::file(&path).holder(), None);
    }

    #[test]
    fn test_stale_marker_blocks_until_purged() {
        let (_dir, path) = scratch();
        fs::write(format!("{path}.lock"), "999999\n").unwrap();

        let mut lock = Lock::file(&path);
        assert!(matches!(lock.acquire(), Err(LockError::Held(_))));

        assert!(lock.purge().unwrap());
        lock.acquire().unwrap();
    }

    #[test]
    fn test_purged_holder_keeps_off_the_next_marker() {
        let (_dir, path) = scratch();

        let mut first = Lock::file(&path);
        first.acquire().unwrap();

        assert!(Lock::file(&path).purge().unwrap());

        let mut second = Lock::file(&path);
        second.acquire().unwrap();

        drop(first);

        let mut third = Lock::file(&path);
        assert!(matches!(third.acquire(), Err(LockError::Held(_))));

        second.release().unwrap();
        third.acquire().unwrap();
    }

    #[test]
    fn test_purged_memory_holder_keeps_off_the_next_key() {
        let held = HeldKeys::default();

        let mut first = Lock::memory(held.clone(), "a");
        first.acquire().unwrap();
        assert!(Lock::memory(held.clone(), "a").purge().unwrap());

        let mut second = Lock::memory(held.clone(), "a");
        second.acquire().unwrap();
        drop(first);

        let mut third = Lock::memory(held.clone(), "a");
        assert!(matches!(third.acquire(), Err(LockError::Held(_))));
        assert!(second.is_held());
    }

    #[test]
    fn test_memory_lock_exclusion() {
        let held = HeldKeys::default();

        let mut first = Lock::memory(held.clone(), "a");
        let mut second = Lock::memory(held.clone(), "a");
        let mut other = Lock::memory(held.clone(), "b");

        first.acquire().unwrap();
        assert!(matches!(second.acquire(), Err(LockError::Held(_))));
        other.acquire().unwrap();

        drop(first);
        second.acquire().unwrap();
    }

    #[test]
    fn test_none_never_contends() {
        let mut a = Lock::none();
        let mut b = Lock::none();
        a.acquire().unwrap();
        b.acquire().unwrap();
    }
}
