//! Cleanup plans
//!
//! A plan is an ordered list of deletion actions, each bound to one table
//! and one predicate. Actions are generated, never edited in place; the
//! plan is ordered by ascending risk so the hardest-to-recover deletions
//! run last.

mod planner;

pub use planner::{plan_event_cleanup, plan_orphan_cleanup, EventRetention};

use crate::config::identifier::{quote, validate};
use crate::config::TimeFormat;
use crate::db::{Omission, Store};
use crate::error::Result;
use crate::ownership::OwnerSource;
use chrono::{DateTime, Utc};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Bound parameters per statement; SQLite's historical limit is 999
pub const MAX_BATCH_PARAMS: usize = 500;

/// How hard a deletion is to recover from, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    EventLog,
    Ancillary,
    Inventory,
}

/// Timestamp bound of an event retention predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cutoff {
    /// Seconds since the epoch
    Unix(i64),
    /// `YYYY-MM-DD HH:MM:SS`, compared through SQLite's `datetime()`
    Iso(String),
}

impl Cutoff {
    pub fn for_format(format: TimeFormat, instant: DateTime<Utc>) -> Self {
        match format {
            TimeFormat::Iso => Cutoff::Iso(instant.format("%Y-%m-%d %H:%M:%S").to_string()),
            TimeFormat::Unix | TimeFormat::Auto => Cutoff::Unix(instant.timestamp()),
        }
    }

    /// `older than cutoff` clause with its single parameter
    pub fn clause(&self, column: &str) -> Result<(String, Value)> {
        let col = quote(validate(column)?);
        Ok(match self {
            Cutoff::Unix(secs) => (format!("{} < ?", col), Value::Integer(*secs)),
            Cutoff::Iso(text) => (
                format!("datetime({}) < datetime(?)", col),
                Value::Text(text.clone()),
            ),
        })
    }
}

/// Which rows of the action's table are deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Rows owned by exactly these ids, re-checked against every registry
    OrphanedOwners {
        owner_column: String,
        owner_ids: Vec<i64>,
        guards: Vec<OwnerSource>,
    },
    /// Events older than the cutoff, optionally of the listed types only
    OlderThan {
        time_column: String,
        cutoff: Cutoff,
        type_column: String,
        event_types: Vec<i64>,
    },
}

/// SQL text with positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    /// Render with parameters inlined, for previews and exported scripts
    pub fn inline(&self) -> String {
        let mut out = String::with_capacity(self.sql.len() + self.params.len() * 8);
        let mut params = self.params.iter();
        for ch in self.sql.chars() {
            if ch == '?' {
                match params.next() {
                    Some(Value::Integer(i)) => {
                        let _ = write!(out, "{}", i);
                    }
                    Some(Value::Text(t)) => {
                        let _ = write!(out, "'{}'", t.replace('\'', "''"));
                    }
                    Some(Value::Real(r)) => {
                        let _ = write!(out, "{}", r);
                    }
                    Some(_) | None => out.push_str("NULL"),
                }
            } else {
                out.push(ch);
            }
        }
        out
    }
}

impl Predicate {
    /// WHERE clauses, one per parameter batch
    pub fn clauses(&self) -> Result<Vec<(String, Vec<Value>)>> {
        match self {
            Predicate::OrphanedOwners {
                owner_column,
                owner_ids,
                guards,
            } => {
                let owner = quote(validate(owner_column)?);
                let mut guard_sql = String::new();
                for guard in guards {
                    let id = quote(validate(&guard.id_column)?);
                    let _ = write!(
                        guard_sql,
                        " AND {owner} NOT IN (SELECT {id} FROM {table} WHERE {id} IS NOT NULL)",
                        owner = owner,
                        id = id,
                        table = quote(validate(&guard.table)?),
                    );
                }
                Ok(owner_ids
                    .chunks(MAX_BATCH_PARAMS)
                    .map(|batch| {
                        let placeholders = vec!["?"; batch.len()].join(", ");
                        (
                            format!("{} IN ({}){}", owner, placeholders, guard_sql),
                            batch.iter().map(|id| Value::Integer(*id)).collect(),
                        )
                    })
                    .collect())
            }
            Predicate::OlderThan {
                time_column,
                cutoff,
                type_column,
                event_types,
            } => {
                let (mut sql, value) = cutoff.clause(time_column)?;
                let mut params = vec![value];
                if !event_types.is_empty() {
                    let placeholders = vec!["?"; event_types.len()].join(", ");
                    let _ = write!(
                        sql,
                        " AND {} IN ({})",
                        quote(validate(type_column)?),
                        placeholders
                    );
                    params.extend(event_types.iter().map(|t| Value::Integer(*t)));
                }
                Ok(vec![(sql, params)])
            }
        }
    }

    /// One-line human description
    pub fn describe(&self) -> String {
        match self {
            Predicate::OrphanedOwners {
                owner_column,
                owner_ids,
                guards,
            } => {
                let registries: Vec<String> = guards
                    .iter()
                    .map(|g| format!("{}.{}", g.table, g.id_column))
                    .collect();
                format!(
                    "{} in {} orphaned ids and absent from [{}]",
                    owner_column,
                    owner_ids.len(),
                    registries.join(", ")
                )
            }
            Predicate::OlderThan {
                time_column,
                cutoff,
                type_column,
                event_types,
            } => {
                let bound = match cutoff {
                    Cutoff::Unix(secs) => secs.to_string(),
                    Cutoff::Iso(text) => text.clone(),
                };
                if event_types.is_empty() {
                    format!("{} < {}", time_column, bound)
                } else {
                    format!(
                        "{} < {} and {} in {:?}",
                        time_column, bound, type_column, event_types
                    )
                }
            }
        }
    }
}

/// One deletion unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupAction {
    pub table: String,
    pub predicate: Predicate,
    /// Rows the predicate matched when planned
    pub rows: u64,
    pub estimated_bytes: u64,
    pub risk: RiskTier,
    pub justification: String,
}

impl CleanupAction {
    fn statements(&self, verb: &str) -> Result<Vec<Statement>> {
        let table = quote(validate(&self.table)?);
        Ok(self
            .predicate
            .clauses()?
            .into_iter()
            .map(|(clause, params)| Statement {
                sql: format!("{} FROM {} WHERE {}", verb, table, clause),
                params,
            })
            .collect())
    }

    pub fn delete_statements(&self) -> Result<Vec<Statement>> {
        self.statements("DELETE")
    }

    pub fn count_statements(&self) -> Result<Vec<Statement>> {
        self.statements("SELECT COUNT(*)")
    }

    /// Rows the predicate matches right now (read-only)
    pub fn count_live(&self, store: &Store) -> Result<u64> {
        if !store.catalog().table_exists(&self.table) {
            return Ok(0);
        }
        let mut total = 0u64;
        for stmt in self.count_statements()? {
            let count: i64 = store.conn.query_row(
                &stmt.sql,
                params_from_iter(stmt.params.iter()),
                |row| row.get(0),
            )?;
            total += count as u64;
        }
        Ok(total)
    }
}

/// Ordered actions plus whatever the planner had to skip
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupPlan {
    actions: Vec<CleanupAction>,
    pub omissions: Vec<Omission>,
}

impl CleanupPlan {
    pub fn new(actions: Vec<CleanupAction>, omissions: Vec<Omission>) -> Self {
        let mut plan = Self { actions, omissions };
        plan.sort();
        plan
    }

    fn sort(&mut self) {
        self.actions.sort_by_key(|a| a.risk);
    }

    pub fn actions(&self) -> &[CleanupAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn total_rows(&self) -> u64 {
        self.actions.iter().map(|a| a.rows).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.actions.iter().map(|a| a.estimated_bytes).sum()
    }

    /// Insert an action at its risk position
    pub fn push(&mut self, action: CleanupAction) {
        self.actions.push(action);
        self.sort();
    }

    pub fn remove(&mut self, index: usize) -> Option<CleanupAction> {
        (index < self.actions.len()).then(|| self.actions.remove(index))
    }

    /// Combine two plans, keeping risk order (stable within a tier)
    pub fn merge(mut self, other: CleanupPlan) -> Self {
        self.actions.extend(other.actions);
        self.omissions.extend(other.omissions);
        self.sort();
        self
    }

    /// SHA-256 over the actions; changes whenever an action is added or removed
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for action in &self.actions {
            hasher.update(action.table.as_bytes());
            hasher.update([0u8]);
            hasher.update(serde_json::to_vec(&action.predicate).unwrap_or_default());
            hasher.update(action.rows.to_le_bytes());
            hasher.update(action.estimated_bytes.to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Reviewable SQL script, one transaction per action
    pub fn to_sql_script(&self, generated_at: DateTime<Utc>) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(out, "-- orphanscan cleanup plan {}", &self.fingerprint()[..12]);
        let _ = writeln!(out, "-- generated {}", generated_at.to_rfc3339());
        let _ = writeln!(
            out,
            "-- {} actions, {} rows, ~{} bytes",
            self.len(),
            self.total_rows(),
            self.total_bytes()
        );
        let _ = writeln!(out, "-- take a backup first: .backup game_backup.db");
        for (i, action) in self.actions.iter().enumerate() {
            let _ = writeln!(out);
            let _ = writeln!(out, "-- [{}] {} ({} rows)", i + 1, action.table, action.rows);
            let _ = writeln!(out, "-- {}", action.justification);
            let _ = writeln!(out, "BEGIN;");
            for stmt in action.delete_statements()? {
                let _ = writeln!(out, "{};", stmt.inline());
            }
            let _ = writeln!(out, "COMMIT;");
        }
        Ok(out)
    }
}
