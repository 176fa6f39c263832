//! CLI argument definitions

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "orphanscan")]
#[command(
    author,
    version,
    about = "Find and safely remove orphaned records from game-state SQLite stores"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Game store to inspect (defaults to $ORPHANSCAN_DB)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Config file (defaults to $ORPHANSCAN_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "cli")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the tables found and which analyses they support
    Schema,

    /// Classify owned records and look for damage from earlier cleanups
    Analyze(AnalyzeArgs),

    /// Event log statistics and retention previews
    Events,

    /// Build a cleanup plan and preview it without touching the store
    Plan(PlanArgs),

    /// Run a cleanup plan through the backup and confirmation gate
    Cleanup(CleanupArgs),
}

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Record this run's structure holdings as the damage baseline
    #[arg(long)]
    pub save_baseline: bool,

    /// Baseline file (defaults to the user data dir)
    #[arg(long)]
    pub baseline: Option<PathBuf>,
}

#[derive(Args, Clone)]
pub struct PlanSelection {
    /// What to clean up
    #[arg(value_enum)]
    pub target: Target,

    /// Event retention in days
    #[arg(long, default_value_t = 30)]
    pub days: i64,

    /// Only delete events of this type (repeatable)
    #[arg(long = "type", value_name = "TYPE")]
    pub types: Vec<i64>,
}

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub selection: PlanSelection,

    /// Also write the plan as a SQL script
    #[arg(long, value_name = "FILE")]
    pub sql: Option<PathBuf>,
}

#[derive(Args)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub selection: PlanSelection,

    /// Backup of the store taken before this run
    #[arg(long, value_name = "FILE")]
    pub backup: PathBuf,

    /// Confirmation token; prompted for when absent
    #[arg(long, value_name = "TOKEN")]
    pub confirm: Option<String>,

    /// Reclaim free pages after a completed cleanup
    #[arg(long)]
    pub vacuum: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Target {
    /// Records whose owner is in no owner registry
    Orphans,
    /// Event log rows past the retention window
    Events,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Cli,
    Json,
}
