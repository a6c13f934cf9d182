//! Command implementations
//!
//! Every command opens the cache with `adopt-existing` forced on, so the
//! artifacts already in the cache root become the registry contents instead
//! of being purged.

use crate::cli::{Cli, Commands};
use crate::errors::CliError;
use crate::shutdown::install_signal_handlers;
use chrono::{DateTime, Utc};
use convcache::{CacheConfig, ConversionCache, Part, PersistentResult, content_id};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Build the effective configuration from the config file and CLI overrides
pub fn build_config(
    config_path: Option<&Path>,
    cache_dir: Option<PathBuf>,
) -> convcache::Result<CacheConfig> {
    let mut config = match config_path {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = cache_dir {
        config.base_path = Some(dir);
    }
    config.adopt_existing = true;
    Ok(config)
}

/// Dispatch the parsed command line
pub async fn run(cli: Cli) -> miette::Result<()> {
    let config = build_config(cli.config.as_deref(), cli.cache_dir)?;
    let json = cli.json;

    match cli.command {
        Commands::Store { files } => {
            let cache = ConversionCache::open(config)?;
            store(&cache, &files, json, &mut io::stdout().lock())?;
        }
        Commands::Show { id } => {
            let cache = ConversionCache::open(config)?;
            show(&cache, &id, json, &mut io::stdout().lock())?;
        }
        Commands::Stats => {
            let cache = ConversionCache::open(config)?;
            stats(&cache, json, &mut io::stdout().lock())?;
        }
        Commands::Gc { quota_kb } => {
            let cache = ConversionCache::open(with_overrides(config, quota_kb, None))?;
            gc(&cache, json, &mut io::stdout().lock())?;
        }
        Commands::Watch {
            quota_kb,
            interval_minutes,
        } => {
            let config = with_overrides(config, quota_kb, interval_minutes);
            watch(config, json).await?;
        }
    }
    Ok(())
}

fn with_overrides(
    mut config: CacheConfig,
    quota_kb: Option<i64>,
    interval_minutes: Option<i64>,
) -> CacheConfig {
    if let Some(quota) = quota_kb {
        config.quota_kb = quota;
    }
    if let Some(minutes) = interval_minutes {
        config.gc_interval_minutes = minutes;
    }
    config
}

#[derive(Debug, Serialize)]
struct StoreOutput {
    id: String,
    parts: usize,
    size_kb: u64,
}

/// Persist `files` as one result keyed by its content identifier
pub fn store<W: Write>(
    cache: &ConversionCache,
    files: &[PathBuf],
    json: bool,
    out: &mut W,
) -> miette::Result<()> {
    let mut parts = Vec::with_capacity(files.len());
    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CliError::InvalidInput { path: file.clone() })?;
        parts.push(Part::from_file(name, file));
    }

    let id = content_id(&parts)?;
    let count = parts.len();
    if !cache.add(&id, PersistentResult::new(parts))? {
        tracing::warn!("Caching is disabled in the configuration; nothing stored");
        return Ok(());
    }
    let size_kb = cache
        .registry()
        .get(&id)
        .map_or(0, |entry| entry.size_kb());

    let output = StoreOutput {
        id,
        parts: count,
        size_kb,
    };
    if json {
        write_json(out, &output)?;
    } else {
        writeln!(out, "{}  {} part(s)  {} KB", output.id, output.parts, output.size_kb)
            .map_err(CliError::from)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PartInfo {
    name: String,
    size_bytes: u64,
    mime_type: Option<String>,
}

/// List the parts of a cached result
pub fn show<W: Write>(
    cache: &ConversionCache,
    id: &str,
    json: bool,
    out: &mut W,
) -> miette::Result<()> {
    let result = cache
        .get(id)
        .ok_or_else(|| CliError::ArtifactNotFound { id: id.to_string() })?;

    let mut parts = Vec::with_capacity(result.len());
    for part in result.parts() {
        parts.push(PartInfo {
            name: part.name().to_string(),
            size_bytes: part.len_bytes()?,
            mime_type: part.mime_type().map(str::to_string),
        });
    }

    if json {
        write_json(out, &parts)?;
    } else {
        for part in &parts {
            writeln!(
                out,
                "{:>10}  {:<24}  {}",
                part.size_bytes,
                part.mime_type.as_deref().unwrap_or("-"),
                part.name
            )
            .map_err(CliError::from)?;
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct EntryInfo {
    id: String,
    size_kb: u64,
    last_accessed: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    base_path: PathBuf,
    entries: usize,
    occupied_kb: u64,
    quota_kb: i64,
    items: Vec<EntryInfo>,
}

/// Report cached entries in eviction order, oldest access first
pub fn stats<W: Write>(cache: &ConversionCache, json: bool, out: &mut W) -> miette::Result<()> {
    let mut snapshot = cache.registry().snapshot();
    snapshot.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed));

    let output = StatsOutput {
        base_path: cache.base_path().to_path_buf(),
        entries: snapshot.len(),
        occupied_kb: cache.total_occupied_kb(),
        quota_kb: cache.config().quota_kb,
        items: snapshot
            .into_iter()
            .map(|e| EntryInfo {
                id: e.key,
                size_kb: e.size_kb,
                last_accessed: e.last_accessed,
            })
            .collect(),
    };

    if json {
        write_json(out, &output)?;
        return Ok(());
    }

    writeln!(out, "Cache root: {}", output.base_path.display()).map_err(CliError::from)?;
    writeln!(
        out,
        "Entries: {}  Occupied: {} KB  Quota: {} KB",
        output.entries, output.occupied_kb, output.quota_kb
    )
    .map_err(CliError::from)?;
    for item in &output.items {
        let accessed = item
            .last_accessed
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
        writeln!(out, "{}  {:>8} KB  {}", item.id, item.size_kb, accessed)
            .map_err(CliError::from)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct GcOutput {
    reclaimed: bool,
    quota_kb: i64,
    entries_before: usize,
    entries_after: usize,
    occupied_before_kb: u64,
    occupied_after_kb: u64,
}

/// Run a single quota check and report what it freed
pub fn gc<W: Write>(cache: &ConversionCache, json: bool, out: &mut W) -> miette::Result<()> {
    let manager = cache.manager();
    let entries_before = cache.len();
    let occupied_before_kb = manager.total_occupied_kb();

    let reclaimed = manager.reclaim_if_needed();

    let output = GcOutput {
        reclaimed,
        quota_kb: manager.quota_kb(),
        entries_before,
        entries_after: cache.len(),
        occupied_before_kb,
        occupied_after_kb: manager.total_occupied_kb(),
    };
    if json {
        write_json(out, &output)?;
    } else if output.reclaimed {
        writeln!(
            out,
            "Reclaimed {} KB: {} -> {} entries, {} -> {} KB (quota {} KB)",
            output.occupied_before_kb.saturating_sub(output.occupied_after_kb),
            output.entries_before,
            output.entries_after,
            output.occupied_before_kb,
            output.occupied_after_kb,
            output.quota_kb
        )
        .map_err(CliError::from)?;
    } else {
        writeln!(
            out,
            "Under quota: {} KB of {} KB used",
            output.occupied_before_kb, output.quota_kb
        )
        .map_err(CliError::from)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct WatchOutput {
    passes: u64,
    checks: u64,
    entries: usize,
    occupied_kb: u64,
}

async fn watch(config: CacheConfig, json: bool) -> miette::Result<()> {
    let mut cache = ConversionCache::open(config)?;
    let shutdown = install_signal_handlers();

    cache.start_gc()?;
    tracing::info!(
        base = %cache.base_path().display(),
        entries = cache.len(),
        "Watching cache, press Ctrl+C to stop"
    );
    shutdown.wait_for_shutdown().await;
    cache.stop_gc().await;

    let manager = cache.manager();
    let output = WatchOutput {
        passes: manager.reclaim_passes(),
        checks: manager.reclaim_checks(),
        entries: cache.len(),
        occupied_kb: manager.total_occupied_kb(),
    };
    let mut out = io::stdout().lock();
    if json {
        write_json(&mut out, &output)?;
    } else {
        writeln!(
            out,
            "Stopped after {} check(s), {} reclamation pass(es); {} entries, {} KB",
            output.checks, output.passes, output.entries, output.occupied_kb
        )
        .map_err(CliError::from)?;
    }
    Ok(())
}

fn write_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), CliError> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
