//! CLI-specific errors rendered through miette

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the CLI itself, as opposed to the cache library
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("No cached result with identifier {id}")]
    #[diagnostic(
        code(convcache::cli::artifact_not_found),
        help("Run 'convcache stats' to list cached identifiers")
    )]
    ArtifactNotFound { id: String },

    #[error("Input file has no usable name: {}", path.display())]
    #[diagnostic(code(convcache::cli::invalid_input))]
    InvalidInput { path: PathBuf },

    #[error("Failed to write command output")]
    #[diagnostic(code(convcache::cli::output))]
    Output {
        #[source]
        source: std::io::Error,
    },
}

impl From<std::io::Error> for CliError {
    fn from(source: std::io::Error) -> Self {
        Self::Output { source }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(source: serde_json::Error) -> Self {
        Self::Output {
            source: source.into(),
        }
    }
}
