//! Thread-safe index of cache entries
//!
//! Identical content persists to one artifact path, so several keys may share
//! an artifact. The registry counts the keys referencing each path and deletes
//! an artifact only when its last key goes. Every change to the key map and
//! every artifact deletion happens under the artifact lock, which is always
//! taken before the key map lock.

use crate::Result;
use crate::entry::CacheEntry;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Point-in-time view of one registered entry, used to order reclamation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    /// Cache key
    pub key: String,
    /// Last access, `None` if never touched
    pub last_accessed: Option<DateTime<Utc>>,
    /// Occupied kilobytes at snapshot time
    pub size_kb: u64,
}

#[derive(Debug, Clone, Copy)]
struct ArtifactRefs {
    keys: usize,
    size_kb: u64,
}

type Artifacts = HashMap<PathBuf, ArtifactRefs>;

/// Maps cache keys to entries; the single source of truth for what is cached
#[derive(Debug, Default)]
pub struct CacheRegistry {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    artifacts: Mutex<Artifacts>,
}

impl CacheRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` under `key`
    ///
    /// An entry previously registered under the same key is released first,
    /// and its artifact deleted unless another key still references it.
    /// A persisted entry must point at an artifact that no concurrent removal
    /// can delete; use [`CacheRegistry::insert`] to persist and register in
    /// one step.
    pub fn put(&self, key: impl Into<String>, entry: CacheEntry) -> Arc<CacheEntry> {
        let mut artifacts = self.artifacts.lock();
        self.register(&mut artifacts, key.into(), entry)
    }

    /// Persist `entry` under `base` and register it under `key`
    ///
    /// Persisting happens under the artifact lock, so a removal of another
    /// key sharing the same content cannot delete the artifact between the
    /// write and the registration. Returns `Ok(None)` when the entry's
    /// result is not persistable; nothing is registered then.
    pub fn insert(
        &self,
        key: impl Into<String>,
        entry: CacheEntry,
        base: &Path,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let mut artifacts = self.artifacts.lock();
        if !entry.persist(base)? {
            return Ok(None);
        }
        Ok(Some(self.register(&mut artifacts, key.into(), entry)))
    }

    fn register(
        &self,
        artifacts: &mut Artifacts,
        key: String,
        entry: CacheEntry,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        if let Some(path) = entry.path() {
            artifacts
                .entry(path)
                .and_modify(|refs| refs.keys += 1)
                .or_insert(ArtifactRefs {
                    keys: 1,
                    size_kb: entry.size_kb(),
                });
        }

        let previous = self.entries.write().insert(key.clone(), Arc::clone(&entry));
        if let Some(previous) = previous {
            if let Err(e) = release(artifacts, &previous) {
                tracing::warn!(key = %key, error = %e, "Failed to remove replaced cache entry");
                // Nothing references the artifact anymore
                if let Some(path) = previous.path() {
                    artifacts.remove(&path);
                }
            }
        }
        entry
    }

    /// Look up the entry registered under `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Whether `key` is registered
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Remove `key` together with its on-disk artifact
    ///
    /// Returns the kilobytes freed, or `None` if the key was not registered.
    /// An artifact still referenced by another key stays on disk and frees
    /// nothing. If the artifact cannot be deleted the key stays registered
    /// and the error is returned, keeping index and disk in agreement.
    pub fn remove(&self, key: &str) -> Result<Option<u64>> {
        let mut artifacts = self.artifacts.lock();
        let Some(entry) = self.get(key) else {
            return Ok(None);
        };
        let freed = release(&mut artifacts, &entry)?;
        self.entries.write().remove(key);
        tracing::debug!(key = %key, freed_kb = freed, "Removed cache entry");
        Ok(Some(freed))
    }

    /// Remove `key` only while it still maps to `entry`
    ///
    /// Used when dropping an entry found to be broken, so that a newer entry
    /// registered under the same key in the meantime survives.
    pub fn remove_if_same(&self, key: &str, entry: &Arc<CacheEntry>) -> Result<Option<u64>> {
        let mut artifacts = self.artifacts.lock();
        match self.get(key) {
            Some(current) if Arc::ptr_eq(&current, entry) => {
                let freed = release(&mut artifacts, &current)?;
                self.entries.write().remove(key);
                Ok(Some(freed))
            }
            _ => Ok(None),
        }
    }

    /// All registered keys
    #[must_use]
    pub fn keys(&self) -> HashSet<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registered entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Kilobytes occupied on disk, each shared artifact counted once
    #[must_use]
    pub fn occupied_kb(&self) -> u64 {
        self.artifacts.lock().values().map(|refs| refs.size_kb).sum()
    }

    /// Number of keys referencing the artifact at `path`
    #[must_use]
    pub fn artifact_refs(&self, path: &Path) -> usize {
        self.artifacts.lock().get(path).map_or(0, |refs| refs.keys)
    }

    /// Keys with their access time and size, captured under one read lock
    #[must_use]
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.entries
            .read()
            .iter()
            .map(|(key, entry)| {
                let (last_accessed, size_kb) = entry.access_and_size();
                EntrySnapshot {
                    key: key.clone(),
                    last_accessed,
                    size_kb,
                }
            })
            .collect()
    }
}

/// Drop one key's reference to `entry`'s artifact, deleting it with the last
fn release(artifacts: &mut Artifacts, entry: &CacheEntry) -> Result<u64> {
    let Some(path) = entry.path() else {
        return Ok(0);
    };
    match artifacts.get_mut(&path) {
        Some(refs) if refs.keys > 1 => {
            refs.keys -= 1;
            entry.detach();
            Ok(0)
        }
        _ => {
            let freed = entry.remove()?;
            artifacts.remove(&path);
            Ok(freed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryState;
    use crate::result::{Part, PersistentResult};
    use std::thread;
    use tempfile::TempDir;

    fn persisted(base: &std::path::Path, content: &str) -> CacheEntry {
        let entry = CacheEntry::new(PersistentResult::single(Part::from_bytes(
            "out.txt",
            content.to_string(),
        )));
        entry.persist(base).unwrap();
        entry
    }

    #[test]
    fn test_put_get_contains() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        assert!(registry.is_empty());

        registry.put("doc-1", persisted(temp.path(), "one"));

        assert!(registry.contains("doc-1"));
        assert!(registry.get("doc-1").is_some());
        assert!(registry.get("doc-2").is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.keys(), HashSet::from(["doc-1".to_string()]));
    }

    #[test]
    fn test_remove_deletes_artifact() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let entry = registry.put("doc", persisted(temp.path(), "payload"));
        let path = entry.path().unwrap();

        assert_eq!(registry.remove("doc").unwrap(), Some(0));
        assert!(!registry.contains("doc"));
        assert!(!path.exists());
        assert_eq!(entry.state(), EntryState::Removed);
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let registry = CacheRegistry::new();
        assert_eq!(registry.remove("nope").unwrap(), None);
        assert_eq!(registry.remove("nope").unwrap(), None);
    }

    #[test]
    fn test_put_replacing_key_removes_previous_artifact() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let old = registry.put("doc", persisted(temp.path(), "v1"));
        let old_path = old.path().unwrap();

        registry.put("doc", persisted(temp.path(), "v2"));

        assert!(!old_path.exists());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shared_artifact_survives_until_last_key() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let a = registry.put("a", persisted(temp.path(), "same"));
        let b = registry.put("b", persisted(temp.path(), "same"));
        let path = a.path().unwrap();
        assert_eq!(b.path().unwrap(), path);
        assert_eq!(registry.artifact_refs(&path), 2);

        assert_eq!(registry.remove("a").unwrap(), Some(0));
        assert!(path.exists());
        assert_eq!(a.state(), EntryState::Removed);
        assert!(b.restore().unwrap().is_some());
        assert_eq!(registry.artifact_refs(&path), 1);

        registry.remove("b").unwrap();
        assert!(!path.exists());
        assert_eq!(registry.artifact_refs(&path), 0);
    }

    #[test]
    fn test_shared_artifact_counted_once() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let content = "x".repeat(4096);
        registry.put("a", persisted(temp.path(), &content));
        registry.put("b", persisted(temp.path(), &content));
        registry.put("c", persisted(temp.path(), &"y".repeat(2048)));

        assert_eq!(registry.occupied_kb(), 6);
        registry.remove("a").unwrap();
        assert_eq!(registry.occupied_kb(), 6);
        registry.remove("b").unwrap();
        assert_eq!(registry.occupied_kb(), 2);
    }

    #[test]
    fn test_readding_identical_content_under_same_key_keeps_artifact() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let old = registry.put("doc", persisted(temp.path(), "same"));
        let path = old.path().unwrap();

        let new = registry.put("doc", persisted(temp.path(), "same"));

        assert!(path.exists());
        assert_eq!(old.state(), EntryState::Removed);
        assert_eq!(new.path().unwrap(), path);
        assert_eq!(registry.artifact_refs(&path), 1);
    }

    #[test]
    fn test_insert_persists_and_registers() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let entry = CacheEntry::new(PersistentResult::single(Part::from_bytes(
            "out.txt",
            vec![0u8; 2048],
        )));

        let entry = registry.insert("doc", entry, temp.path()).unwrap().unwrap();

        assert_eq!(entry.state(), EntryState::Persisted);
        assert!(registry.contains("doc"));
        assert_eq!(registry.occupied_kb(), 2);
    }

    #[test]
    fn test_insert_skips_volatile_result() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let entry = CacheEntry::new(PersistentResult::volatile(vec![Part::from_bytes(
            "a", "b",
        )]));

        assert!(registry.insert("doc", entry, temp.path()).unwrap().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_reports_size_and_access() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let big = CacheEntry::new(PersistentResult::single(Part::from_bytes(
            "big",
            vec![0u8; 4096],
        )));
        big.persist(temp.path()).unwrap();
        registry.put("big", big);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, "big");
        assert_eq!(snapshot[0].size_kb, 4);
        assert!(snapshot[0].last_accessed.is_some());
    }

    #[test]
    fn test_concurrent_put_get_remove() {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(CacheRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                let base = temp.path().to_path_buf();
                thread::spawn(move || {
                    for i in 0..25 {
                        let key = format!("t{t}-{i}");
                        registry.put(key.clone(), persisted(&base, &key));
                        assert!(registry.get(&key).is_some());
                        if i % 2 == 0 {
                            registry.remove(&key).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 8 * 12);
        assert_eq!(registry.snapshot().len(), registry.len());
    }

    #[test]
    fn test_concurrent_shared_content_keeps_index_and_disk_in_step() {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(CacheRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                let base = temp.path().to_path_buf();
                thread::spawn(move || {
                    for i in 0..25 {
                        let key = format!("t{t}-{i}");
                        let entry = CacheEntry::new(PersistentResult::single(Part::from_bytes(
                            "out.txt", "shared",
                        )));
                        registry.insert(key.clone(), entry, &base).unwrap();
                        if i % 2 == 0 {
                            registry.remove(&key).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for key in registry.keys() {
            let entry = registry.get(&key).unwrap();
            assert!(entry.path().unwrap().exists(), "{key} lost its artifact");
        }
        let path = registry.get("t0-1").unwrap().path().unwrap();
        assert_eq!(registry.artifact_refs(&path), 8 * 12);
    }
}
