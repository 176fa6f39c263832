//! Plan command

use crate::app::{OutputFormat, PlanArgs, PlanSelection, Target};
use crate::output::{self, terminal};
use anyhow::Result;
use chrono::{DateTime, Utc};
use orphanscan_core::{
    plan_event_cleanup, plan_orphan_cleanup, Analyzer, CleanupPlan, Config, EventRetention,
    ExecutionSession, MemoryAuditLog, Store,
};

/// Build the plan a selection asks for
pub fn build(
    selection: &PlanSelection,
    store: &Store,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<CleanupPlan> {
    let plan = match selection.target {
        Target::Orphans => {
            let analysis = Analyzer::run(store, config, now)?;
            let mut plan = plan_orphan_cleanup(
                &analysis.classifications,
                &analysis.space,
                &config.schema.owned_tables,
            );
            let mut omissions = analysis.report.omissions;
            omissions.append(&mut plan.omissions);
            plan.omissions = omissions;
            plan
        }
        Target::Events => {
            let retention =
                EventRetention::days(selection.days).with_types(selection.types.iter().copied());
            plan_event_cleanup(store, &config.schema.events, &retention, now)?
        }
    };
    Ok(plan)
}

pub async fn run(args: PlanArgs, store: &Store, config: &Config, format: OutputFormat) -> Result<()> {
    let now = Utc::now();
    let plan = build(&args.selection, store, config, now)?;
    let omissions = plan.omissions.clone();

    if let Some(path) = &args.sql {
        std::fs::write(path, plan.to_sql_script(now)?)?;
        tracing::info!(path = %path.display(), "sql script written");
    }

    // Previews go through a throwaway session so they match what cleanup shows
    let mut session =
        ExecutionSession::new(plan, config.gate.clone(), Box::new(MemoryAuditLog::new()))?;
    let preview = session.dry_run(store)?;
    session.abort("preview only")?;

    match format {
        OutputFormat::Json => output::print_json(&serde_json::json!({
            "preview": preview,
            "omissions": omissions,
        }))?,
        OutputFormat::Cli => {
            print!("{}", terminal::format_preview(&preview));
            print!("{}", terminal::format_omissions(&omissions));
            if let Some(path) = &args.sql {
                println!("\nSQL script written to {}", path.display());
            }
        }
    }
    Ok(())
}
