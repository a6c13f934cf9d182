//! Cache configuration
//!
//! Values are read once when the cache and its scheduler are created;
//! changing them requires building new ones.

use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default disk quota (10 MiB)
pub const DEFAULT_QUOTA_KB: i64 = 10 * 1024;

/// Default reclamation cadence in minutes
pub const DEFAULT_GC_INTERVAL_MINUTES: i64 = 10;

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "CONVCACHE_DIR";

/// Configuration for a [`crate::ConversionCache`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache root; resolved with [`resolve_cache_root`] when unset
    pub base_path: Option<PathBuf>,
    /// Disk quota in kilobytes; negative reclaims everything on each pass
    pub quota_kb: i64,
    /// Reclamation cadence in minutes; negative means milliseconds
    pub gc_interval_minutes: i64,
    /// When false nothing is cached
    pub enabled: bool,
    /// Register artifacts found in the cache root at startup instead of purging them
    pub adopt_existing: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            quota_kb: DEFAULT_QUOTA_KB,
            gc_interval_minutes: DEFAULT_GC_INTERVAL_MINUTES,
            enabled: true,
            adopt_existing: false,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::configuration(format!("Invalid cache configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_toml_str(&content)
    }

    /// Reject values the cache cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.gc_interval_minutes == 0 {
            return Err(Error::configuration(
                "gc-interval-minutes must be non-zero (negative values are milliseconds)",
            ));
        }
        Ok(())
    }

    /// Reclamation interval with the sentinel applied
    pub fn gc_interval(&self) -> Result<ReclaimInterval> {
        ReclaimInterval::from_minutes(self.gc_interval_minutes)
    }

    /// The configured base path, or the first writable default location
    pub fn cache_root(&self) -> Result<PathBuf> {
        match &self.base_path {
            Some(path) => Ok(path.clone()),
            None => resolve_cache_root(),
        }
    }
}

/// Sleep duration between reclamation passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimInterval(Duration);

impl ReclaimInterval {
    /// Interpret a configured minute count
    ///
    /// Negative values are taken as milliseconds (`-250` is 250ms), a fast
    /// path for tests. Zero is rejected.
    pub fn from_minutes(minutes: i64) -> Result<Self> {
        match minutes {
            0 => Err(Error::configuration("reclaim interval must be non-zero")),
            m if m < 0 => Ok(Self(Duration::from_millis(m.unsigned_abs()))),
            m => Ok(Self(Duration::from_secs(m.unsigned_abs() * 60))),
        }
    }

    /// The interval as a [`Duration`]
    #[must_use]
    pub const fn as_duration(self) -> Duration {
        self.0
    }
}

impl From<Duration> for ReclaimInterval {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

/// Inputs for determining the cache root directory
#[derive(Debug, Clone)]
struct CacheInputs {
    convcache_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) CONVCACHE_DIR (explicit override)
    // 2) XDG_CACHE_HOME/convcache
    // 3) OS cache dir/convcache
    // 4) ~/.convcache/cache
    // 5) TMPDIR/convcache
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.convcache_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("convcache"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("convcache"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".convcache/cache"));
    }
    candidates.push(inputs.temp_dir.join("convcache"));

    for path in candidates {
        // An existing directory may be read-only (e.g. a mounted CI cache)
        if path.exists() {
            let marker = path.join(".write_check");
            if fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&marker)
                .is_ok()
            {
                let _ = fs::remove_file(&marker);
                return Ok(path);
            }
            continue;
        }
        if fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

/// Pick the default cache root from the environment
pub fn resolve_cache_root() -> Result<PathBuf> {
    let inputs = CacheInputs {
        convcache_dir: std::env::var(CACHE_DIR_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        xdg_cache_home: std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    };
    cache_root_from_inputs(inputs)
}
