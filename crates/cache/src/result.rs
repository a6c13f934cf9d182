//! Conversion results and their on-disk representation
//!
//! A [`PersistentResult`] is an ordered list of [`Part`]s produced by one
//! conversion. Persisting writes it under the cache base directory at a path
//! named by [`content_id`]:
//!
//! - a single part becomes a single file at `<base>/<id>`
//! - several parts become a directory `<base>/<id>/` holding one file per
//!   part, named by the part name (which may contain `/` to nest files)
//!
//! Loading a directory promotes the top-level part named `index.html`
//! (case-insensitive) to position zero so the front page of an export bundle
//! can be served without knowing its name. Nested pages such as
//! `docs/index.html` keep their place.

use crate::{Error, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

/// File name promoted to the first part when a multi-part result is loaded
pub const INDEX_PAGE: &str = "index.html";

/// Suffix of staging files and directories that have not been renamed yet
pub(crate) const TMP_SUFFIX: &str = ".tmp";

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Payload of a single part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartData {
    /// Bytes held in memory
    Bytes(Bytes),
    /// A file written by the converter; copied into the cache on persist
    File(PathBuf),
}

/// One named payload within a conversion result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    name: String,
    mime_type: Option<String>,
    data: PartData,
}

impl Part {
    /// Create a part from in-memory bytes
    #[must_use]
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            data: PartData::Bytes(data.into()),
        }
    }

    /// Create a part referencing a file on disk
    #[must_use]
    pub fn from_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            data: PartData::File(path.into()),
        }
    }

    /// Attach a content-type hint
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Part name (relative path inside a multi-part artifact)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content-type hint, if known
    #[must_use]
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Raw payload
    #[must_use]
    pub const fn data(&self) -> &PartData {
        &self.data
    }

    /// Read the full payload into memory
    pub fn read_bytes(&self) -> Result<Bytes> {
        match &self.data {
            PartData::Bytes(bytes) => Ok(bytes.clone()),
            PartData::File(path) => fs::read(path)
                .map(Bytes::from)
                .map_err(|e| Error::io(e, path, "read")),
        }
    }

    /// Payload length in bytes
    pub fn len_bytes(&self) -> Result<u64> {
        match &self.data {
            PartData::Bytes(bytes) => Ok(bytes.len() as u64),
            PartData::File(path) => fs::metadata(path)
                .map(|m| m.len())
                .map_err(|e| Error::io(e, path, "metadata")),
        }
    }

    fn write_to(&self, dst: &Path) -> Result<u64> {
        match &self.data {
            PartData::Bytes(bytes) => {
                fs::write(dst, bytes).map_err(|e| Error::io(e, dst, "write"))?;
                Ok(bytes.len() as u64)
            }
            PartData::File(src) => fs::copy(src, dst).map_err(|e| Error::io(e, dst, "copy")),
        }
    }

    fn hash_into(&self, hasher: &mut Sha256) -> Result<()> {
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        match &self.data {
            PartData::Bytes(bytes) => hasher.update(bytes),
            PartData::File(path) => {
                let file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
                let mut reader = BufReader::new(file);
                let mut buf = vec![0u8; HASH_BUFFER_SIZE];
                loop {
                    let n = reader
                        .read(&mut buf)
                        .map_err(|e| Error::io(e, path, "read"))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
            }
        }
        hasher.update([0u8]);
        Ok(())
    }
}

/// Location and footprint of a persisted result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedArtifact {
    /// File (single part) or directory (multi-part) holding the result
    pub path: PathBuf,
    /// Total payload bytes written
    pub bytes_written: u64,
}

impl PersistedArtifact {
    /// Footprint in whole kilobytes, rounded down
    #[must_use]
    pub const fn size_kb(&self) -> u64 {
        self.bytes_written / 1024
    }
}

/// The output of one conversion, made of one or more parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentResult {
    parts: Vec<Part>,
    persistable: bool,
}

impl PersistentResult {
    /// Create a result that may be written to disk
    #[must_use]
    pub fn new(parts: Vec<Part>) -> Self {
        Self {
            parts,
            persistable: true,
        }
    }

    /// Create a result that must never be written to disk
    #[must_use]
    pub fn volatile(parts: Vec<Part>) -> Self {
        Self {
            parts,
            persistable: false,
        }
    }

    /// Create a single-part result
    #[must_use]
    pub fn single(part: Part) -> Self {
        Self::new(vec![part])
    }

    /// All parts in order
    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Consume the result, yielding its parts
    #[must_use]
    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }

    /// The part served by default (the index page after a load)
    #[must_use]
    pub fn primary(&self) -> Option<&Part> {
        self.parts.first()
    }

    /// Look up a part by exact name
    #[must_use]
    pub fn part(&self, name: &str) -> Option<&Part> {
        self.parts.iter().find(|p| p.name == name)
    }

    /// Number of parts
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// True when there are no parts
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Whether the cache may write this result to disk
    #[must_use]
    pub const fn is_persistable(&self) -> bool {
        self.persistable
    }

    /// Payload size in whole kilobytes, rounded down
    ///
    /// For a result returned by [`PersistentResult::load`] this equals the
    /// footprint recorded when it was persisted.
    pub fn size_kb(&self) -> Result<u64> {
        let mut total = 0u64;
        for part in &self.parts {
            total += part.len_bytes()?;
        }
        Ok(total / 1024)
    }

    /// Write the result under `base` at its content-derived path
    ///
    /// Parts are staged in a uniquely named temporary file or directory
    /// beside the target and renamed into place, so readers never observe a
    /// partial artifact. When the target already exists it holds identical
    /// content and is reused as is. Concurrent callers persisting the same
    /// content all succeed with the same path.
    pub fn persist(&self, base: &Path) -> Result<PersistedArtifact> {
        if self.parts.is_empty() {
            return Err(Error::EmptyResult);
        }
        if self.parts.len() > 1 {
            for part in &self.parts {
                validate_part_name(&part.name)?;
            }
        }

        let id = content_id(&self.parts)?;
        fs::create_dir_all(base).map_err(|e| Error::io(e, base, "create_dir_all"))?;
        let path = base.join(&id);

        if path.exists() {
            let bytes_written = disk_usage(&path)?;
            tracing::debug!(id = %id, bytes = bytes_written, "Reusing persisted conversion result");
            return Ok(PersistedArtifact {
                path,
                bytes_written,
            });
        }

        let prefix = format!("{id}.");
        let mut staging = tempfile::Builder::new();
        staging.prefix(&prefix).suffix(TMP_SUFFIX);

        let bytes_written = if let [part] = self.parts.as_slice() {
            let tmp = staging
                .tempfile_in(base)
                .map_err(|e| Error::io(e, base, "create_temp_file"))?;
            let written = part.write_to(tmp.path())?;
            if let Err(e) = tmp.persist(&path) {
                // Losing the race to an identical writer is fine
                if !path.exists() {
                    return Err(Error::io(e.error, &path, "rename"));
                }
            }
            written
        } else {
            let tmp = staging
                .tempdir_in(base)
                .map_err(|e| Error::io(e, base, "create_temp_dir"))?;
            let mut total = 0u64;
            for part in &self.parts {
                let dst = tmp.path().join(&part.name);
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| Error::io(e, parent, "create_dir_all"))?;
                }
                total += part.write_to(&dst)?;
            }
            match fs::rename(tmp.path(), &path) {
                Ok(()) => {
                    let _ = tmp.keep();
                }
                // A directory rename never replaces a populated target; the
                // staged copy is dropped with `tmp`
                Err(_) if path.exists() => {}
                Err(e) => return Err(Error::io(e, &path, "rename")),
            }
            total
        };

        tracing::debug!(
            id = %id,
            parts = self.parts.len(),
            bytes = bytes_written,
            "Persisted conversion result"
        );

        Ok(PersistedArtifact {
            path,
            bytes_written,
        })
    }

    /// Rebuild a result from a path written by [`PersistentResult::persist`]
    pub fn load(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| Error::io(e, path, "metadata"))?;

        if meta.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let bytes = fs::read(path).map_err(|e| Error::io(e, path, "read"))?;
            return Ok(Self::single(loaded_part(name, bytes)));
        }

        let mut parts = Vec::new();
        for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::io(e.into(), path, "walk"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file = entry.path();
            let rel = file.strip_prefix(path).map_err(|_| {
                Error::configuration(format!(
                    "path {} is not under {}",
                    file.display(),
                    path.display()
                ))
            })?;
            let bytes = fs::read(file).map_err(|e| Error::io(e, file, "read"))?;
            parts.push(loaded_part(rel.to_string_lossy().into_owned(), bytes));
        }

        promote_index_page(&mut parts);
        Ok(Self::new(parts))
    }
}

/// Compute the content-derived identifier for a list of parts
///
/// SHA-256 over every part's name and payload, hex encoded. The identifier
/// is independent of the cache key the result is registered under.
pub fn content_id(parts: &[Part]) -> Result<String> {
    let mut hasher = Sha256::new();
    for part in parts {
        part.hash_into(&mut hasher)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Delete a persisted artifact, file or directory tree
pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| Error::io(e, path, "metadata"))?;
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|e| Error::io(e, path, "remove"))
}

/// Sum of file sizes under `path`, which may be a single file
pub(crate) fn disk_usage(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|e| Error::io(e.into(), path, "walk"))?;
        if entry.file_type().is_file() {
            let meta = entry
                .metadata()
                .map_err(|e| Error::io(e.into(), entry.path(), "metadata"))?;
            total += meta.len();
        }
    }
    Ok(total)
}

fn validate_part_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_part_name(name))
    }
}

fn is_index_page(name: &str) -> bool {
    name.eq_ignore_ascii_case(INDEX_PAGE)
}

fn promote_index_page(parts: &mut Vec<Part>) {
    let index = parts
        .iter()
        .enumerate()
        .filter(|(_, p)| is_index_page(&p.name))
        .min_by(|(_, a), (_, b)| a.name.cmp(&b.name))
        .map(|(i, _)| i);
    if let Some(i) = index {
        let page = parts.remove(i);
        parts.insert(0, page);
    }
}

fn loaded_part(name: String, bytes: Vec<u8>) -> Part {
    let mime_type = guess_mime_type(&name).map(str::to_string);
    Part {
        name,
        mime_type,
        data: PartData::Bytes(Bytes::from(bytes)),
    }
}

fn guess_mime_type(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_string_lossy().to_ascii_lowercase();
    let mime = match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(mime)
}
