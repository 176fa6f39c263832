//! Schema command

use crate::app::OutputFormat;
use crate::output;
use anyhow::Result;
use orphanscan_core::config::TimeFormat;
use orphanscan_core::db::TableInfo;
use orphanscan_core::{Config, OwnerKind, Store};
use serde::Serialize;

#[derive(Serialize)]
struct Support {
    analysis: String,
    supported: bool,
    detail: String,
}

#[derive(Serialize)]
struct SchemaSummary<'a> {
    tables: Vec<&'a TableInfo>,
    support: Vec<Support>,
}

fn support(analysis: impl Into<String>, result: Result<String, String>) -> Support {
    let (supported, detail) = match result {
        Ok(detail) => (true, detail),
        Err(reason) => (false, reason),
    };
    Support {
        analysis: analysis.into(),
        supported,
        detail,
    }
}

pub async fn run(store: &Store, config: &Config, format: OutputFormat) -> Result<()> {
    let catalog = store.catalog();
    let schema = &config.schema;
    let mut rows = Vec::new();

    for kind in OwnerKind::PRIORITY {
        let result = kind
            .registry(schema, catalog)
            .map(|r| format!("{}.{}", r.table, r.id_column))
            .ok_or_else(|| "registry table or id column missing".to_string());
        rows.push(support(format!("owner space: {}", kind), result));
    }
    for owned in &schema.owned_tables {
        let result = catalog
            .require(&owned.table, &[owned.owner_column.as_str()])
            .map(|_| format!("{}.{}", owned.table, owned.owner_column))
            .map_err(|e| e.to_string());
        rows.push(support(format!("orphan scan: {}", owned.table), result));
    }
    let events = store
        .resolve_time_format(&schema.events)
        .map(|f| {
            let label = match f {
                TimeFormat::Iso => "iso",
                TimeFormat::Unix | TimeFormat::Auto => "unix",
            };
            format!("{}.{} ({})", schema.events.table, schema.events.time_column, label)
        })
        .map_err(|e| e.to_string());
    rows.push(support("event retention", events));
    let damage = catalog
        .require(
            &schema.buildings.table,
            &[
                schema.buildings.object_column.as_str(),
                schema.buildings.owner_column.as_str(),
            ],
        )
        .map(|_| schema.buildings.table.clone())
        .map_err(|e| e.to_string());
    rows.push(support("damage detection", damage));

    match format {
        OutputFormat::Json => output::print_json(&SchemaSummary {
            tables: catalog.tables().collect(),
            support: rows,
        })?,
        OutputFormat::Cli => {
            println!("Tables:");
            for table in catalog.tables() {
                let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
                println!("  {:<20} {}", table.name, columns.join(", "));
            }
            println!();
            println!("Analyses:");
            for row in &rows {
                println!(
                    "  {:<28} {:<4} {}",
                    row.analysis,
                    if row.supported { "yes" } else { "no" },
                    row.detail
                );
            }
        }
    }
    Ok(())
}
