//! Disk-backed cache for document conversion results
//!
//! This crate stores the output of expensive conversions (rendering a
//! document to HTML, PDF, images, ...) on disk and keeps the total footprint
//! under a configured quota:
//! - [`PersistentResult`]: one or more named parts and their on-disk layout
//! - [`CacheEntry`]: a result plus access-time and size bookkeeping
//! - [`CacheRegistry`]: the thread-safe key -> entry index
//! - [`ReclaimManager`]: least-recently-accessed eviction against the quota
//! - [`ReclaimScheduler`]: the background loop driving the manager
//!
//! # Disk layout
//!
//! Each entry occupies one path under the base directory, named by the hex
//! SHA-256 of its content (not by its cache key). A single-part result is a
//! plain file; a multi-part result is a directory with one file per part.
//!
//! # Quota sentinels
//!
//! A negative `quota-kb` reclaims every entry on each pass, and a negative
//! `gc-interval-minutes` is read as milliseconds.

// TODO(cache-docs): Add # Errors documentation to all fallible public functions
#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

mod cache;
pub mod config;
pub mod entry;
mod error;
pub mod reclaim;
pub mod registry;
pub mod result;
pub mod scheduler;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use cache::ConversionCache;
pub use config::{CacheConfig, ReclaimInterval, resolve_cache_root};
pub use entry::{CacheEntry, EntryState};
pub use reclaim::{ReclaimManager, ReclaimStats};
pub use registry::{CacheRegistry, EntrySnapshot};
pub use result::{INDEX_PAGE, Part, PartData, PersistedArtifact, PersistentResult, content_id};
pub use scheduler::{ReclaimScheduler, SchedulerState};
