//! Orphanscan CLI
//!
//! Find records whose owner no longer exists in a game-state store and
//! remove them behind a dry run, a backup check and a typed confirmation.

use anyhow::{Context, Result};
use clap::Parser;
use orphanscan_core::error::exit_codes;
use orphanscan_core::{Config, OrphanScanError, Store};
use std::path::PathBuf;

mod app;
mod commands;
mod output;

use app::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    if let Err(err) = run(cli).await {
        output::terminal::error_line(&format!("{:#}", err));
        let code = err
            .downcast_ref::<OrphanScanError>()
            .map(|e| e.exit_code())
            .unwrap_or(exit_codes::GENERAL_ERROR);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Use --db, then ORPHANSCAN_DB
    let db_path = cli
        .db
        .clone()
        .or_else(|| std::env::var("ORPHANSCAN_DB").ok().map(PathBuf::from))
        .ok_or_else(|| {
            OrphanScanError::InvalidInput("no store given; pass --db or set ORPHANSCAN_DB".into())
        })?;

    let open_read_only = || {
        Store::open_read_only(&db_path).with_context(|| format!("opening {}", db_path.display()))
    };

    match cli.command {
        Commands::Schema => commands::schema::run(&open_read_only()?, &config, cli.format).await,
        Commands::Analyze(args) => {
            commands::analyze::run(args, &open_read_only()?, &config, cli.format).await
        }
        Commands::Events => commands::events::run(&open_read_only()?, &config, cli.format).await,
        Commands::Plan(args) => {
            commands::plan::run(args, &open_read_only()?, &config, cli.format).await
        }
        Commands::Cleanup(args) => {
            let mut store = Store::open(&db_path)
                .with_context(|| format!("opening {}", db_path.display()))?;
            commands::cleanup::run(args, &mut store, &config, cli.format).await
        }
    }
}
