//! Cleanup command

use super::plan;
use crate::app::{CleanupArgs, OutputFormat};
use crate::output::{self, terminal};
use anyhow::Result;
use chrono::Utc;
use orphanscan_core::{
    BackupSignal, Config, ExecutionSession, OrphanScanError, SessionState, Store,
};
use std::io::{BufRead, Write};

fn prompt_token(challenge: &str) -> Result<String> {
    let mut stderr = std::io::stderr();
    writeln!(stderr, "This permanently deletes the rows listed above.")?;
    write!(stderr, "Type '{}' to proceed: ", challenge)?;
    stderr.flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Close the session after a gate refusal and hand the refusal back
fn refused(session: &mut ExecutionSession, err: OrphanScanError) -> anyhow::Error {
    if let Err(abort_err) = session.abort(&format!("refused: {}", err)) {
        tracing::warn!(error = %abort_err, "could not abort session");
    }
    err.into()
}

pub async fn run(
    args: CleanupArgs,
    store: &mut Store,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let now = Utc::now();
    let plan = plan::build(&args.selection, store, config, now)?;
    if plan.is_empty() {
        if format == OutputFormat::Cli {
            println!("Nothing to clean up");
            print!("{}", terminal::format_omissions(&plan.omissions));
        } else {
            output::print_json(&serde_json::json!({ "actions": 0, "omissions": plan.omissions }))?;
        }
        return Ok(());
    }

    let mut session = ExecutionSession::open(plan, config.gate.clone())?;
    let audit_path = config.gate.audit_dir().join(format!("{}.jsonl", session.id()));
    let preview = session.dry_run(store)?;
    if format == OutputFormat::Cli {
        print!("{}", terminal::format_preview(&preview));
        println!();
    }

    let signal = BackupSignal::probe(&args.backup, now)?;
    if let Err(err) = session.verify_backup(Some(&signal)) {
        return Err(refused(&mut session, err));
    }

    let challenge = session.confirmation_challenge();
    let token = match args.confirm {
        Some(token) => token,
        None => prompt_token(&challenge)?,
    };
    if let Err(err) = session.confirm(&token) {
        return Err(refused(&mut session, err));
    }

    let report = match session.execute(store) {
        Ok(report) => report,
        Err(err) if err.is_gate_refusal() => return Err(refused(&mut session, err)),
        Err(err) => return Err(err.into()),
    };

    match format {
        OutputFormat::Json => output::print_json(&serde_json::json!({
            "preview": preview,
            "report": report,
            "audit_log": audit_path,
        }))?,
        OutputFormat::Cli => {
            print!("{}", terminal::format_execution(&report));
            println!("Audit log: {}", audit_path.display());
        }
    }

    if report.state == SessionState::Completed {
        if args.vacuum {
            store.vacuum()?;
        }
        if format == OutputFormat::Cli {
            terminal::success_line("cleanup completed");
        }
    }
    report.into_result()?;
    Ok(())
}
