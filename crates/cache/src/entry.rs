//! Cache entries and their persistence lifecycle
//!
//! An entry moves through `Fresh -> Persisted -> Removed`. While fresh it
//! owns the in-memory [`PersistentResult`]; once persisted only the disk path
//! and the footprint are kept, so memory stays bounded no matter how much
//! has been cached.

use crate::result::{PersistentResult, disk_usage, remove_path};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

/// Lifecycle state of a [`CacheEntry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Holds the result in memory, nothing on disk yet
    Fresh,
    /// Result lives on disk only
    Persisted,
    /// Disk artifact deleted; terminal
    Removed,
}

#[derive(Debug)]
enum Slot {
    Fresh(PersistentResult),
    Persisted { path: PathBuf, size_kb: u64 },
    Removed,
}

#[derive(Debug)]
struct Inner {
    slot: Slot,
    last_accessed: Option<DateTime<Utc>>,
}

/// A cached conversion result with access-time bookkeeping
#[derive(Debug)]
pub struct CacheEntry {
    inner: Mutex<Inner>,
}

impl CacheEntry {
    /// Wrap a freshly computed result
    #[must_use]
    pub fn new(result: PersistentResult) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slot: Slot::Fresh(result),
                last_accessed: Some(Utc::now()),
            }),
        }
    }

    /// Build a persisted entry for an artifact already present on disk
    ///
    /// The footprint is measured from the files on disk and the last access
    /// time is taken from the artifact's modification time. When no time is
    /// available the entry sorts as the oldest candidate for reclamation.
    pub fn adopt(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = fs::metadata(&path).map_err(|e| Error::io(e, &path, "metadata"))?;
        let last_accessed = meta.modified().ok().map(DateTime::<Utc>::from);
        let size_kb = disk_usage(&path)? / 1024;
        Ok(Self {
            inner: Mutex::new(Inner {
                slot: Slot::Persisted { path, size_kb },
                last_accessed,
            }),
        })
    }

    /// Write the wrapped result under `base`
    ///
    /// Returns `Ok(true)` once the entry is on disk and `Ok(false)` when the
    /// result cannot be persisted at all (or the entry was removed). On error
    /// the entry stays fresh and keeps its result.
    pub fn persist(&self, base: &Path) -> Result<bool> {
        let mut inner = self.inner.lock();
        let artifact = match &inner.slot {
            Slot::Fresh(result) if !result.is_persistable() => return Ok(false),
            Slot::Fresh(result) => result.persist(base)?,
            Slot::Persisted { .. } => return Ok(true),
            Slot::Removed => return Ok(false),
        };
        let size_kb = artifact.size_kb();
        // Replacing the slot drops the in-memory result
        inner.slot = Slot::Persisted {
            path: artifact.path,
            size_kb,
        };
        Ok(true)
    }

    /// Access the entry, reloading its result from disk when persisted
    ///
    /// The access time is refreshed whatever the state. Returns `Ok(None)`
    /// if the entry was never persisted or has been removed. The artifact is
    /// read without holding the entry lock, so a removal racing the read
    /// surfaces as an I/O error rather than waiting for it.
    pub fn restore(&self) -> Result<Option<PersistentResult>> {
        let path = {
            let mut inner = self.inner.lock();
            inner.last_accessed = Some(Utc::now());
            match &inner.slot {
                Slot::Persisted { path, .. } => path.clone(),
                Slot::Fresh(_) | Slot::Removed => return Ok(None),
            }
        };
        PersistentResult::load(&path).map(Some)
    }

    /// Delete the on-disk artifact and return the kilobytes freed
    ///
    /// Only a persisted entry changes state. An artifact that has already
    /// vanished from disk counts as removed. On any other failure the entry
    /// stays persisted so a later attempt can retry.
    pub fn remove(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Slot::Persisted { path, size_kb } = &inner.slot else {
            return Ok(0);
        };
        let freed = *size_kb;
        match remove_path(path) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(path = %path.display(), "Cache artifact already gone");
            }
            Err(e) => return Err(e),
        }
        inner.slot = Slot::Removed;
        Ok(freed)
    }

    /// Mark the entry removed while its artifact stays on disk
    ///
    /// Used when another entry still references the same artifact.
    pub(crate) fn detach(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.slot, Slot::Persisted { .. }) {
            inner.slot = Slot::Removed;
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> EntryState {
        match self.inner.lock().slot {
            Slot::Fresh(_) => EntryState::Fresh,
            Slot::Persisted { .. } => EntryState::Persisted,
            Slot::Removed => EntryState::Removed,
        }
    }

    /// True while the result lives on disk
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.state() == EntryState::Persisted
    }

    /// Disk path of the artifact, defined only while persisted
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        match &self.inner.lock().slot {
            Slot::Persisted { path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    /// Occupied kilobytes, zero unless persisted
    #[must_use]
    pub fn size_kb(&self) -> u64 {
        match self.inner.lock().slot {
            Slot::Persisted { size_kb, .. } => size_kb,
            _ => 0,
        }
    }

    /// Time of the last access, if any
    #[must_use]
    pub fn last_accessed(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_accessed
    }

    /// Access time and size read under one lock
    pub(crate) fn access_and_size(&self) -> (Option<DateTime<Utc>>, u64) {
        let inner = self.inner.lock();
        let size_kb = match inner.slot {
            Slot::Persisted { size_kb, .. } => size_kb,
            _ => 0,
        };
        (inner.last_accessed, size_kb)
    }

    #[cfg(test)]
    pub(crate) fn set_last_accessed(&self, at: Option<DateTime<Utc>>) {
        self.inner.lock().last_accessed = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Part;
    use tempfile::TempDir;

    fn sample(bytes: usize) -> PersistentResult {
        PersistentResult::single(Part::from_bytes("out.bin", vec![1u8; bytes]))
    }

    #[test]
    fn test_new_entry_is_fresh() {
        let entry = CacheEntry::new(sample(10));
        assert_eq!(entry.state(), EntryState::Fresh);
        assert_eq!(entry.size_kb(), 0);
        assert!(entry.path().is_none());
        assert!(entry.last_accessed().is_some());
    }

    #[test]
    fn test_persist_records_path_and_size() {
        let temp = TempDir::new().unwrap();
        let entry = CacheEntry::new(sample(5 * 1024));

        assert!(entry.persist(temp.path()).unwrap());
        assert_eq!(entry.state(), EntryState::Persisted);
        assert_eq!(entry.size_kb(), 5);
        assert!(entry.path().unwrap().is_file());
    }

    #[test]
    fn test_persist_twice_is_harmless() {
        let temp = TempDir::new().unwrap();
        let entry = CacheEntry::new(sample(10));
        assert!(entry.persist(temp.path()).unwrap());
        assert!(entry.persist(temp.path()).unwrap());
    }

    #[test]
    fn test_volatile_result_is_not_persisted() {
        let temp = TempDir::new().unwrap();
        let entry = CacheEntry::new(PersistentResult::volatile(vec![Part::from_bytes(
            "a", "b",
        )]));
        assert!(!entry.persist(temp.path()).unwrap());
        assert_eq!(entry.state(), EntryState::Fresh);
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_persist_stays_fresh() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();

        let entry = CacheEntry::new(sample(10));
        assert!(entry.persist(&blocker).is_err());
        assert_eq!(entry.state(), EntryState::Fresh);

        // Retrying against a usable base succeeds with the retained result
        assert!(entry.persist(temp.path()).unwrap());
    }

    #[test]
    fn test_empty_result_persist_fails() {
        let temp = TempDir::new().unwrap();
        let entry = CacheEntry::new(PersistentResult::new(vec![]));
        assert!(matches!(
            entry.persist(temp.path()),
            Err(Error::EmptyResult)
        ));
    }

    #[test]
    fn test_restore_fresh_returns_none_but_touches() {
        let entry = CacheEntry::new(sample(10));
        entry.set_last_accessed(None);
        assert!(entry.restore().unwrap().is_none());
        assert!(entry.last_accessed().is_some());
    }

    #[test]
    fn test_restore_persisted_reloads() {
        let temp = TempDir::new().unwrap();
        let entry = CacheEntry::new(sample(2048));
        entry.persist(temp.path()).unwrap();
        let before = entry.last_accessed();

        std::thread::sleep(std::time::Duration::from_millis(2));
        let restored = entry.restore().unwrap().unwrap();

        assert_eq!(restored.size_kb().unwrap(), 2);
        assert!(entry.last_accessed() > before);
    }

    #[test]
    fn test_restore_after_external_delete_fails() {
        let temp = TempDir::new().unwrap();
        let entry = CacheEntry::new(sample(10));
        entry.persist(temp.path()).unwrap();
        fs::remove_file(entry.path().unwrap()).unwrap();

        let err = entry.restore().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_deletes_artifact_and_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let entry = CacheEntry::new(sample(3 * 1024));
        entry.persist(temp.path()).unwrap();
        let path = entry.path().unwrap();

        assert_eq!(entry.remove().unwrap(), 3);
        assert!(!path.exists());
        assert_eq!(entry.state(), EntryState::Removed);
        assert_eq!(entry.size_kb(), 0);

        assert_eq!(entry.remove().unwrap(), 0);
        assert!(entry.restore().unwrap().is_none());
    }

    #[test]
    fn test_detach_keeps_artifact() {
        let temp = TempDir::new().unwrap();
        let entry = CacheEntry::new(sample(10));
        entry.persist(temp.path()).unwrap();
        let path = entry.path().unwrap();

        entry.detach();

        assert_eq!(entry.state(), EntryState::Removed);
        assert!(path.exists());
        assert_eq!(entry.remove().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_restore_does_not_block_removal() {
        let temp = TempDir::new().unwrap();
        let entry = std::sync::Arc::new(CacheEntry::new(sample(256 * 1024)));
        entry.persist(temp.path()).unwrap();

        let reader = {
            let entry = std::sync::Arc::clone(&entry);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    // Either a full result, a miss after removal, or a not-found error
                    match entry.restore() {
                        Ok(Some(result)) => assert_eq!(result.size_kb().unwrap(), 256),
                        Ok(None) => break,
                        Err(e) => assert!(e.is_not_found()),
                    }
                }
            })
        };
        assert_eq!(entry.remove().unwrap(), 256);
        reader.join().unwrap();
        assert!(entry.restore().unwrap().is_none());
    }

    #[test]
    fn test_remove_fresh_is_noop() {
        let entry = CacheEntry::new(sample(10));
        assert_eq!(entry.remove().unwrap(), 0);
        assert_eq!(entry.state(), EntryState::Fresh);
    }

    #[test]
    fn test_remove_tolerates_missing_artifact() {
        let temp = TempDir::new().unwrap();
        let entry = CacheEntry::new(sample(1024));
        entry.persist(temp.path()).unwrap();
        fs::remove_file(entry.path().unwrap()).unwrap();

        assert_eq!(entry.remove().unwrap(), 1);
        assert_eq!(entry.state(), EntryState::Removed);
    }

    #[test]
    fn test_adopt_measures_existing_artifact() {
        let temp = TempDir::new().unwrap();
        let artifact = PersistentResult::new(vec![
            Part::from_bytes("index.html", vec![0u8; 2048]),
            Part::from_bytes("a/b.css", vec![0u8; 1024]),
        ])
        .persist(temp.path())
        .unwrap();

        let entry = CacheEntry::adopt(&artifact.path).unwrap();
        assert_eq!(entry.state(), EntryState::Persisted);
        assert_eq!(entry.size_kb(), 3);
        assert!(entry.last_accessed().is_some());
        assert_eq!(
            entry.restore().unwrap().unwrap().primary().unwrap().name(),
            "index.html"
        );
    }
}
