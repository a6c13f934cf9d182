//! Quota enforcement by least-recently-accessed eviction

use crate::registry::CacheRegistry;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of one reclamation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimStats {
    /// Entries removed from the registry and from disk
    pub entries_removed: usize,
    /// Kilobytes freed by those removals
    pub freed_kb: u64,
    /// Entries skipped because their artifact could not be deleted
    pub failures: usize,
}

/// Keeps the total footprint of a [`CacheRegistry`] under a quota
///
/// A negative quota means every persisted entry is reclaimed on each pass.
#[derive(Debug)]
pub struct ReclaimManager {
    registry: Arc<CacheRegistry>,
    quota_kb: i64,
    passes: AtomicU64,
    checks: AtomicU64,
}

impl ReclaimManager {
    /// Create a manager enforcing `quota_kb` on `registry`
    #[must_use]
    pub fn new(registry: Arc<CacheRegistry>, quota_kb: i64) -> Self {
        Self {
            registry,
            quota_kb,
            passes: AtomicU64::new(0),
            checks: AtomicU64::new(0),
        }
    }

    /// Registry this manager reclaims from
    #[must_use]
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Configured quota in kilobytes
    #[must_use]
    pub const fn quota_kb(&self) -> i64 {
        self.quota_kb
    }

    /// Occupied size of every registered artifact, computed fresh
    ///
    /// An artifact shared by several keys counts once.
    #[must_use]
    pub fn total_occupied_kb(&self) -> u64 {
        self.registry.occupied_kb()
    }

    /// Run a reclamation pass if the occupied size reaches the quota
    ///
    /// Returns `true` when a pass ran.
    pub fn reclaim_if_needed(&self) -> bool {
        let occupied = self.total_occupied_kb();
        let deficit_kb = if self.quota_kb < 0 {
            occupied
        } else {
            let quota = self.quota_kb as u64;
            if occupied < quota {
                self.checks.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(occupied_kb = occupied, quota_kb = quota, "Cache under quota");
                return false;
            }
            occupied - quota
        };

        let stats = self.reclaim(deficit_kb);
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.checks.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            occupied_kb = occupied,
            quota_kb = self.quota_kb,
            deficit_kb,
            freed_kb = stats.freed_kb,
            removed = stats.entries_removed,
            failures = stats.failures,
            "Reclaimed cache space"
        );
        true
    }

    /// Evict entries, oldest access first, until more than `deficit_kb` is freed
    ///
    /// Entries never accessed go first. Entries sharing an access time are
    /// each considered in turn. An entry whose artifact cannot be deleted is
    /// skipped and the pass continues with the next one.
    pub fn reclaim(&self, deficit_kb: u64) -> ReclaimStats {
        let mut candidates = self.registry.snapshot();
        // Stable sort on a list, never keyed by timestamp alone
        candidates.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed));

        let mut stats = ReclaimStats::default();
        for candidate in candidates {
            if stats.freed_kb > deficit_kb {
                break;
            }
            match self.registry.remove(&candidate.key) {
                Ok(Some(freed)) => {
                    stats.entries_removed += 1;
                    stats.freed_kb += freed;
                }
                // Removed concurrently since the snapshot
                Ok(None) => {}
                Err(e) => {
                    stats.failures += 1;
                    tracing::warn!(
                        key = %candidate.key,
                        error = %e,
                        "Failed to reclaim cache entry, skipping"
                    );
                }
            }
        }
        stats
    }

    /// Passes that evicted entries since creation
    #[must_use]
    pub fn reclaim_passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Quota checks performed since creation
    #[must_use]
    pub fn reclaim_checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheEntry;
    use crate::result::{Part, PersistentResult};
    use chrono::{DateTime, Duration, Utc};
    use std::path::Path;
    use tempfile::TempDir;

    fn add(
        registry: &CacheRegistry,
        base: &Path,
        key: &str,
        kb: usize,
        at: Option<DateTime<Utc>>,
    ) {
        // The key goes into the payload so every entry gets its own artifact
        let mut payload = key.as_bytes().to_vec();
        payload.resize(kb * 1024, 0);
        let entry = CacheEntry::new(PersistentResult::single(Part::from_bytes(key, payload)));
        entry.persist(base).unwrap();
        entry.set_last_accessed(at);
        registry.put(key, entry);
    }

    fn setup(quota_kb: i64) -> (TempDir, Arc<CacheRegistry>, ReclaimManager) {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(CacheRegistry::new());
        let manager = ReclaimManager::new(Arc::clone(&registry), quota_kb);
        (temp, registry, manager)
    }

    fn t(seconds: i64) -> Option<DateTime<Utc>> {
        Some(DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(seconds))
    }

    #[test]
    fn test_total_occupied_sums_entries() {
        let (temp, registry, manager) = setup(100);
        add(&registry, temp.path(), "a", 3, t(1));
        add(&registry, temp.path(), "b", 4, t(2));
        assert_eq!(manager.total_occupied_kb(), 7);
    }

    #[test]
    fn test_under_quota_only_counts_check() {
        let (temp, registry, manager) = setup(100);
        add(&registry, temp.path(), "a", 5, t(1));

        assert!(!manager.reclaim_if_needed());
        assert_eq!(manager.reclaim_checks(), 1);
        assert_eq!(manager.reclaim_passes(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_scenario_evicts_two_oldest_of_three() {
        let (temp, registry, manager) = setup(8);
        add(&registry, temp.path(), "A", 5, t(1));
        add(&registry, temp.path(), "B", 5, t(2));
        add(&registry, temp.path(), "C", 5, t(3));

        assert!(manager.reclaim_if_needed());

        assert!(!registry.contains("A"));
        assert!(!registry.contains("B"));
        assert!(registry.contains("C"));
        assert_eq!(manager.total_occupied_kb(), 5);
        assert_eq!(manager.reclaim_passes(), 1);
        assert_eq!(manager.reclaim_checks(), 1);
    }

    #[test]
    fn test_eviction_follows_access_not_insertion_order() {
        let (temp, registry, manager) = setup(0);
        add(&registry, temp.path(), "newest", 1, t(30));
        add(&registry, temp.path(), "oldest", 1, t(10));
        add(&registry, temp.path(), "middle", 1, t(20));

        let stats = manager.reclaim(1);

        assert_eq!(stats.entries_removed, 2);
        assert_eq!(stats.freed_kb, 2);
        assert!(registry.contains("newest"));
    }

    #[test]
    fn test_same_timestamp_entries_all_evictable() {
        let (temp, registry, manager) = setup(-1);
        add(&registry, temp.path(), "x", 2, t(5));
        add(&registry, temp.path(), "y", 2, t(5));
        add(&registry, temp.path(), "z", 2, t(5));

        let stats = manager.reclaim(4);

        assert_eq!(stats.entries_removed, 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_never_accessed_entries_go_first() {
        let (temp, registry, manager) = setup(0);
        add(&registry, temp.path(), "touched", 1, t(1));
        add(&registry, temp.path(), "untouched", 1, None);

        let stats = manager.reclaim(0);

        assert_eq!(stats.entries_removed, 1);
        assert!(registry.contains("touched"));
        assert!(!registry.contains("untouched"));
    }

    #[test]
    fn test_negative_quota_evicts_everything() {
        let (temp, registry, manager) = setup(-1);
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            add(&registry, temp.path(), key, i + 1, t(i as i64));
        }

        assert!(manager.reclaim_if_needed());
        assert!(registry.is_empty());
        assert_eq!(manager.total_occupied_kb(), 0);
        assert_eq!(fs_entries(temp.path()), 0);
    }

    #[test]
    fn test_quota_reached_exactly_evicts_one() {
        let (temp, registry, manager) = setup(4);
        add(&registry, temp.path(), "a", 2, t(1));
        add(&registry, temp.path(), "b", 2, t(2));

        assert!(manager.reclaim_if_needed());
        assert_eq!(registry.keys().len(), 1);
        assert!(registry.contains("b"));
    }

    #[test]
    fn test_repeated_passes_converge_under_quota() {
        let (temp, registry, manager) = setup(10);
        for i in 0..12 {
            add(&registry, temp.path(), &format!("k{i}"), 3, t(i));
        }

        while manager.reclaim_if_needed() {}

        assert!(manager.total_occupied_kb() <= 10);
        assert!(manager.reclaim_checks() > manager.reclaim_passes());
    }

    #[test]
    fn test_shared_artifact_counted_once_and_freed_with_last_key() {
        let (temp, registry, manager) = setup(5);
        for (key, at) in [("a", t(1)), ("b", t(2))] {
            let entry = CacheEntry::new(PersistentResult::single(Part::from_bytes(
                "shared.pdf",
                vec![7u8; 4096],
            )));
            entry.persist(temp.path()).unwrap();
            entry.set_last_accessed(at);
            registry.put(key, entry);
        }
        add(&registry, temp.path(), "c", 4, t(3));
        let shared = registry.get("a").unwrap().path().unwrap();
        assert_eq!(manager.total_occupied_kb(), 8);

        assert!(manager.reclaim_if_needed());

        // Dropping "a" alone frees nothing, so "b" goes too and "c" stays
        assert!(!registry.contains("a"));
        assert!(!registry.contains("b"));
        assert!(registry.contains("c"));
        assert!(!shared.exists());
        assert_eq!(manager.total_occupied_kb(), 4);
    }

    #[test]
    fn test_empty_registry_pass_is_harmless() {
        let (_temp, _registry, manager) = setup(-1);
        assert!(manager.reclaim_if_needed());
        assert_eq!(manager.reclaim(10), ReclaimStats::default());
    }

    #[cfg(unix)]
    #[test]
    fn test_undeletable_entry_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, registry, manager) = setup(-1);
        let locked = temp.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        add(&registry, &locked, "stuck", 1, t(1));
        add(&registry, temp.path(), "free", 1, t(2));

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        let stats = manager.reclaim(u64::MAX);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Root ignores directory permissions, in which case both go
        if stats.failures == 1 {
            assert!(registry.contains("stuck"));
            assert_eq!(stats.entries_removed, 1);
        } else {
            assert_eq!(stats.entries_removed, 2);
        }
        assert!(!registry.contains("free"));
    }

    fn fs_entries(path: &Path) -> usize {
        std::fs::read_dir(path).unwrap().count()
    }
}
