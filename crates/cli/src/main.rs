//! `convcache`: store, inspect and reclaim conversion results in a disk cache

mod cli;
mod commands;
mod errors;
mod shutdown;
mod tracing;

use crate::cli::Cli;
use crate::tracing::{TracingConfig, init_tracing};
use clap::Parser;

#[tokio::main]
#[allow(clippy::print_stderr)]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    if let Err(error) = run_main().await {
        eprintln!("{error:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> miette::Result<()> {
    let cli = Cli::parse();

    init_tracing(TracingConfig {
        format: cli.log_format,
        level: cli.level.into(),
        filter: cli.log_filter.clone(),
    })?;

    commands::run(cli).await
}
