//! The conversion cache as used by callers
//!
//! [`ConversionCache`] wires the registry, the reclaim manager, and the
//! scheduler together around one base directory. Results are persisted as
//! soon as they are added; a lookup whose artifact has gone bad is dropped
//! and reported as a miss.

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::reclaim::ReclaimManager;
use crate::registry::CacheRegistry;
use crate::result::{PersistentResult, TMP_SUFFIX, remove_path};
use crate::scheduler::{ReclaimScheduler, SchedulerState};
use crate::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Disk-backed cache of conversion results
#[derive(Debug)]
pub struct ConversionCache {
    config: CacheConfig,
    base_path: PathBuf,
    registry: Arc<CacheRegistry>,
    manager: Arc<ReclaimManager>,
    scheduler: ReclaimScheduler,
}

impl ConversionCache {
    /// Open the cache rooted at the configured (or resolved) base path
    ///
    /// Artifacts left from a previous run are purged, or registered again
    /// when `adopt-existing` is set. Only names that look like content
    /// identifiers are touched.
    pub fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let base_path = config.cache_root()?;
        fs::create_dir_all(&base_path)
            .map_err(|e| Error::io(e, &base_path, "create_dir_all"))?;

        let registry = Arc::new(CacheRegistry::new());
        if config.adopt_existing {
            adopt_artifacts(&base_path, &registry)?;
        } else {
            purge_artifacts(&base_path)?;
        }

        let manager = Arc::new(ReclaimManager::new(Arc::clone(&registry), config.quota_kb));
        let scheduler = ReclaimScheduler::new(Arc::clone(&manager), config.gc_interval()?);

        tracing::debug!(
            base = %base_path.display(),
            entries = registry.len(),
            quota_kb = config.quota_kb,
            enabled = config.enabled,
            "Opened conversion cache"
        );

        Ok(Self {
            config,
            base_path,
            registry,
            manager,
            scheduler,
        })
    }

    /// Persist `result` and register it under `key`
    ///
    /// Returns `Ok(false)` when caching is disabled or the result cannot be
    /// persisted; nothing is registered in that case.
    pub fn add(&self, key: &str, result: PersistentResult) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let entry = CacheEntry::new(result);
        let Some(entry) = self.registry.insert(key, entry, &self.base_path)? else {
            tracing::debug!(key = %key, "Result is not persistable, not caching");
            return Ok(false);
        };
        tracing::debug!(key = %key, size_kb = entry.size_kb(), "Cached conversion result");
        Ok(true)
    }

    /// Restore the result cached under `key`
    ///
    /// An entry whose artifact can no longer be read is removed and the
    /// lookup is a miss.
    pub fn get(&self, key: &str) -> Option<PersistentResult> {
        if !self.config.enabled {
            return None;
        }
        let entry = self.registry.get(key)?;
        match entry.restore() {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cached result unreadable, dropping entry");
                if let Err(e) = self.registry.remove_if_same(key, &entry) {
                    tracing::warn!(key = %key, error = %e, "Failed to drop unreadable entry");
                }
                None
            }
        }
    }

    /// Remove `key` and its artifact; returns whether it was cached
    pub fn invalidate(&self, key: &str) -> Result<bool> {
        Ok(self.registry.remove(key)?.is_some())
    }

    /// Keys currently cached
    #[must_use]
    pub fn keys(&self) -> HashSet<String> {
        self.registry.keys()
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// True when nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Occupied kilobytes across all entries
    #[must_use]
    pub fn total_occupied_kb(&self) -> u64 {
        self.manager.total_occupied_kb()
    }

    /// Directory holding the artifacts
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Configuration the cache was opened with
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Underlying registry
    #[must_use]
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Reclaim manager enforcing the quota
    #[must_use]
    pub fn manager(&self) -> &Arc<ReclaimManager> {
        &self.manager
    }

    /// Start background reclamation on the current tokio runtime
    pub fn start_gc(&mut self) -> Result<()> {
        self.scheduler.start()
    }

    /// Stop background reclamation, letting a running pass finish
    pub async fn stop_gc(&mut self) {
        self.scheduler.stop().await;
    }

    /// State of the background reclamation loop
    #[must_use]
    pub fn gc_state(&self) -> SchedulerState {
        self.scheduler.state()
    }
}

/// Artifact names are hex SHA-256 digests; staging names add a random
/// component and a temp suffix (`<id>.<random>.tmp`)
fn is_artifact_name(name: &str) -> bool {
    let id = match name.strip_suffix(TMP_SUFFIX) {
        Some(staged) => staged.split('.').next().unwrap_or(staged),
        None => name,
    };
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn artifact_paths(base: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(base).map_err(|e| Error::io(e, base, "read_dir"))? {
        let entry = entry.map_err(|e| Error::io(e, base, "read_dir_entry"))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_artifact_name(&name) {
            found.push((name, entry.path()));
        }
    }
    Ok(found)
}

fn purge_artifacts(base: &Path) -> Result<()> {
    let mut purged = 0usize;
    for (_, path) in artifact_paths(base)? {
        match remove_path(&path) {
            Ok(()) => purged += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to purge stale artifact"),
        }
    }
    if purged > 0 {
        tracing::info!(base = %base.display(), purged, "Purged stale cache artifacts");
    }
    Ok(())
}

fn adopt_artifacts(base: &Path, registry: &CacheRegistry) -> Result<()> {
    for (name, path) in artifact_paths(base)? {
        // Interrupted writes are never valid artifacts
        if name.ends_with(TMP_SUFFIX) {
            if let Err(e) = remove_path(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove interrupted write");
            }
            continue;
        }
        match CacheEntry::adopt(&path) {
            Ok(entry) => {
                registry.put(name, entry);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable artifact");
            }
        }
    }
    Ok(())
}
