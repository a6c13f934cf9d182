use crate::tracing::{LogLevel, TracingFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "convcache")]
#[command(about = "Inspect and maintain a disk-backed conversion result cache")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    #[arg(
        long,
        global = true,
        help = "Log output format",
        default_value = "compact",
        value_enum
    )]
    pub log_format: TracingFormat,

    #[arg(
        long,
        global = true,
        help = "Tracing filter directives, e.g. 'convcache=debug' (overrides --level and RUST_LOG)"
    )]
    pub log_filter: Option<String>,

    #[arg(
        short = 'c',
        long,
        global = true,
        env = "CONVCACHE_CONFIG",
        help = "Path to a TOML cache configuration"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "CONVCACHE_DIR",
        help = "Cache root directory (overrides the configuration)"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Print command output as JSON")]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Persist files as one cached result and print its identifier")]
    Store {
        #[arg(required = true, help = "Files forming the result; several become a bundle")]
        files: Vec<PathBuf>,
    },
    #[command(about = "List the parts of a cached result, index page first")]
    Show {
        #[arg(help = "Artifact identifier printed by 'store' or 'stats'")]
        id: String,
    },
    #[command(about = "Show cached entries and occupied space")]
    Stats,
    #[command(about = "Run one reclamation pass against the quota")]
    Gc {
        #[arg(
            long,
            allow_negative_numbers = true,
            help = "Quota in KB (negative reclaims everything)"
        )]
        quota_kb: Option<i64>,
    },
    #[command(about = "Reclaim periodically until interrupted")]
    Watch {
        #[arg(
            long,
            allow_negative_numbers = true,
            help = "Quota in KB (negative reclaims everything)"
        )]
        quota_kb: Option<i64>,
        #[arg(
            long,
            allow_negative_numbers = true,
            help = "Minutes between passes (negative means milliseconds)"
        )]
        interval_minutes: Option<i64>,
    },
}
