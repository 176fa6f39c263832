//! Events command

use crate::app::OutputFormat;
use crate::output::{self, terminal};
use anyhow::Result;
use chrono::Utc;
use orphanscan_core::{Config, Store};

pub async fn run(store: &Store, config: &Config, format: OutputFormat) -> Result<()> {
    let stats = store.event_stats(&config.schema.events, Utc::now())?;

    match format {
        OutputFormat::Json => output::print_json(&stats)?,
        OutputFormat::Cli => print!("{}", terminal::format_event_stats(&stats)),
    }
    Ok(())
}
