//! Error types for the conversion cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(convcache::io),
        help("Check file permissions and free space on the cache volume")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "write", "remove", "walk")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(convcache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Attempted to persist a result without any parts
    #[error("Conversion result has no parts to persist")]
    #[diagnostic(
        code(convcache::empty_result),
        help("An empty result is treated as nothing to cache")
    )]
    EmptyResult,

    /// Part name that would escape the entry directory
    #[error("Invalid part name: {name:?}")]
    #[diagnostic(
        code(convcache::invalid_part_name),
        help("Part names must be non-empty relative paths without '..' components")
    )]
    InvalidPartName {
        /// The rejected part name
        name: String,
    },

    /// Reclaim scheduler lifecycle error
    #[error("Reclaim scheduler error: {message}")]
    #[diagnostic(code(convcache::scheduler))]
    Scheduler {
        /// Error message describing the scheduler issue
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an invalid part name error
    #[must_use]
    pub fn invalid_part_name(name: impl Into<String>) -> Self {
        Self::InvalidPartName { name: name.into() }
    }

    /// Create a scheduler error
    #[must_use]
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler {
            message: msg.into(),
        }
    }

    /// Returns true if this error wraps an I/O "not found" condition
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display_includes_path() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            "/cache/abc",
            "write",
        );
        assert_eq!(err.to_string(), "I/O write failed: /cache/abc");
    }

    #[test]
    fn test_is_not_found() {
        let missing = Error::io(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/x",
            "read",
        );
        assert!(missing.is_not_found());
        assert!(!Error::EmptyResult.is_not_found());
    }

    #[test]
    fn test_invalid_part_name_message() {
        let err = Error::invalid_part_name("../etc/passwd");
        assert!(err.to_string().contains("../etc/passwd"));
    }
}
