//! Terminal output formatter

use orphanscan_core::analysis::AnalysisReport;
use orphanscan_core::gate::{ActionStatus, DryRunPreview, ExecutionReport};
use orphanscan_core::{EventStats, Omission, Severity};
use std::io::{IsTerminal, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

fn choice(is_terminal: bool) -> ColorChoice {
    if is_terminal {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    }
}

fn labelled(mut stream: StandardStream, color: Color, label: &str, text: &str) {
    let _ = stream.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true));
    let _ = write!(stream, "{}", label);
    let _ = stream.reset();
    let _ = writeln!(stream, " {}", text);
}

/// Severity-coloured line on stdout
pub fn severity_line(severity: Severity, text: &str) {
    let color = match severity {
        Severity::Normal => Color::Green,
        Severity::Warning => Color::Yellow,
        Severity::Critical => Color::Red,
    };
    let stream = StandardStream::stdout(choice(std::io::stdout().is_terminal()));
    labelled(stream, color, &format!("[{}]", severity), text);
}

pub fn success_line(text: &str) {
    let stream = StandardStream::stdout(choice(std::io::stdout().is_terminal()));
    labelled(stream, Color::Green, "ok:", text);
}

/// Red `error:` line on stderr
pub fn error_line(text: &str) {
    let stream = StandardStream::stderr(choice(std::io::stderr().is_terminal()));
    labelled(stream, Color::Red, "error:", text);
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn format_omissions(omissions: &[Omission]) -> String {
    if omissions.is_empty() {
        return String::new();
    }
    let mut output = String::from("\nSkipped:\n");
    for omission in omissions {
        output.push_str(&format!("  {:<28} {}\n", omission.scope, omission.reason));
    }
    output
}

pub fn format_report(report: &AnalysisReport) -> String {
    let mut output = String::new();
    output.push_str("Owner space:\n");
    for (kind, count) in &report.owner_space {
        output.push_str(&format!("  {:<12} {}\n", kind.to_string(), count));
    }

    output.push_str(&format!("\nRecords scanned: {}\n", report.records_scanned));
    output.push_str(&format!("  Proven:              {}\n", report.confidence.proven));
    output.push_str(&format!(
        "  Plausible:           {}\n",
        report.confidence.plausible_unverified
    ));
    output.push_str(&format!("  Orphaned:            {}\n", report.confidence.orphaned));
    if report.conflicts > 0 {
        output.push_str(&format!("  Conflicting owners:  {}\n", report.conflicts));
    }

    if report.orphaned_owners.is_empty() {
        output.push_str("\nNo orphaned records\n");
    } else {
        output.push_str(&format!(
            "\nOrphaned: {} records, {} across {} owner ids\n",
            report.orphaned_records,
            format_bytes(report.orphaned_bytes),
            report.orphaned_owners.len()
        ));
        for owner in report.orphaned_owners.iter().take(10) {
            output.push_str(&format!(
                "  {:>12}  {:>6} records  {:>10}  {}\n",
                owner.owner_id,
                owner.records,
                format_bytes(owner.bytes),
                owner.tables.join(", ")
            ));
        }
        if report.orphaned_owners.len() > 10 {
            output.push_str(&format!(
                "  ... and {} more\n",
                report.orphaned_owners.len() - 10
            ));
        }
    }

    if let Some(pattern) = &report.id_pattern {
        output.push_str(&format!(
            "\nId pattern: {}..={} in {} ranges{}\n",
            pattern.min,
            pattern.max,
            pattern.total_ranges,
            if pattern.appears_sequential {
                " (sequential, likely a mass deletion)"
            } else {
                ""
            }
        ));
        for (start, end) in &pattern.ranges {
            if start == end {
                output.push_str(&format!("  {}\n", start));
            } else {
                output.push_str(&format!("  {}-{}\n", start, end));
            }
        }
    }

    if !report.traces.is_empty() {
        output.push_str("\nTraces:\n");
        for trace in &report.traces {
            let found: Vec<String> = trace
                .references
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(col, n)| format!("{}={}", col, n))
                .collect();
            output.push_str(&format!(
                "  {:>12}  {}\n",
                trace.owner_id,
                if found.is_empty() {
                    "no references".to_string()
                } else {
                    found.join(" ")
                }
            ));
        }
    }

    output.push_str(&format_omissions(&report.omissions));
    output
}

pub fn format_event_stats(stats: &EventStats) -> String {
    let mut output = String::new();
    output.push_str(&format!("Table:        {}\n", stats.table));
    output.push_str(&format!("Events:       {}\n", stats.total_events));
    output.push_str(&format!(
        "Time column:  {} ({:?})\n",
        stats.time_column, stats.time_format
    ));
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        output.push_str(&format!("Oldest:       {}\n", oldest.to_rfc3339()));
        output.push_str(&format!("Newest:       {}\n", newest.to_rfc3339()));
    }
    if let Some(days) = stats.history_days() {
        output.push_str(&format!("History:      {} days\n", days));
    }
    output.push_str("\nRetention:\n");
    for preview in &stats.retention {
        output.push_str(&format!(
            "  keep {:>3} days  removes {}\n",
            preview.keep_days, preview.rows_removed
        ));
    }
    output
}

pub fn format_preview(preview: &DryRunPreview) -> String {
    if preview.lines.is_empty() {
        return "Nothing to clean up\n".to_string();
    }
    let mut output = format!(
        "Plan {} ({} actions, {} rows, ~{})\n",
        &preview.fingerprint[..12],
        preview.lines.len(),
        preview.total_rows,
        format_bytes(preview.total_bytes)
    );
    for line in &preview.lines {
        output.push_str(&format!(
            "\n[{}] {} ({:?}): {} rows planned, {} now\n",
            line.index + 1,
            line.table,
            line.risk,
            line.planned_rows,
            line.live_rows
        ));
        output.push_str(&format!("    {}\n", line.justification));
        output.push_str(&format!("    where {}\n", line.predicate));
    }
    output
}

pub fn format_execution(report: &ExecutionReport) -> String {
    let mut output = format!("Session {}: {}\n", report.session_id, report.state);
    for outcome in &report.outcomes {
        let status = match &outcome.status {
            ActionStatus::Committed { rows_affected } => format!("deleted {}", rows_affected),
            ActionStatus::CommittedUnaudited {
                rows_affected,
                reason,
            } => format!("deleted {} (NOT AUDITED: {})", rows_affected, reason),
            ActionStatus::Failed { reason } => format!("FAILED: {}", reason),
            ActionStatus::NotAttempted => "not attempted".to_string(),
        };
        output.push_str(&format!(
            "  [{}] {:<20} {}\n",
            outcome.index + 1,
            outcome.table,
            status
        ));
    }
    output.push_str(&format!("Rows deleted: {}\n", report.rows_affected()));
    if let Some(err) = &report.audit_error {
        output.push_str(&format!("Audit log incomplete: {}\n", err));
    }
    output
}
