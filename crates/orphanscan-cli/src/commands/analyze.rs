//! Analyze command

use crate::app::{AnalyzeArgs, OutputFormat};
use crate::output::{self, terminal};
use anyhow::Result;
use chrono::Utc;
use orphanscan_core::{Analyzer, Baseline, Config, Severity, Store};

pub async fn run(
    args: AnalyzeArgs,
    store: &Store,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let baseline_path = args.baseline.unwrap_or_else(Baseline::default_path);
    let mut config = config.clone();
    if config.damage.baseline_average.is_none() {
        if let Some(baseline) = Baseline::load(&baseline_path)? {
            tracing::info!(
                average = baseline.average,
                recorded_at = %baseline.recorded_at,
                "using saved damage baseline"
            );
            config.damage.baseline_average = Some(baseline.average);
        }
    }

    let now = Utc::now();
    let analysis = Analyzer::run(store, &config, now)?;
    let report = &analysis.report;

    match format {
        OutputFormat::Json => output::print_json(report)?,
        OutputFormat::Cli => {
            print!("{}", terminal::format_report(report));
            if let Some(damage) = &report.damage {
                println!();
                let text = format!(
                    "{} of {} active owners have structures with no stored items ({:.1}%, baseline {:.2} per owner)",
                    damage.zeroed_owners,
                    damage.active_owners,
                    damage.zeroed_ratio * 100.0,
                    damage.baseline_average
                );
                terminal::severity_line(damage.severity, &text);
                if let Some(note) = &damage.note {
                    println!("  {}", note);
                }
                if damage.severity == Severity::Critical {
                    println!("  An earlier cleanup may have deleted structure-held items; restore from backup before cleaning further.");
                }
            }
        }
    }

    if args.save_baseline {
        match report
            .damage
            .as_ref()
            .and_then(|d| Baseline::from_report(d, now))
        {
            Some(baseline) => {
                baseline.save(&baseline_path)?;
                if format == OutputFormat::Cli {
                    terminal::success_line(&format!(
                        "baseline saved to {}",
                        baseline_path.display()
                    ));
                }
            }
            None => tracing::warn!("store is not healthy enough to serve as a baseline; not saved"),
        }
    }
    Ok(())
}
