//! Analysis driver
//!
//! One read-only pass over the store: owner space, record snapshots,
//! classification, id patterns, reference traces and damage detection.

use crate::config::{Config, TraceColumn};
use crate::damage::{detect, DamageReport, Severity};
use crate::db::{Omission, Store};
use crate::error::{OrphanScanError, Result};
use crate::ownership::{classify_all, Classification, Confidence, OwnerKind, OwnerSpace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Orphaned owner ids sampled for reference traces
const TRACE_SAMPLE: usize = 5;

/// Contiguous ranges kept in an id pattern
const PATTERN_RANGES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfidenceCounts {
    pub proven: usize,
    pub plausible_unverified: usize,
    pub orphaned: usize,
}

/// An owner id none of the registries know, with what it still holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedOwner {
    pub owner_id: i64,
    pub records: u64,
    pub bytes: u64,
    pub tables: Vec<String>,
}

/// Shape of the orphaned owner ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdPattern {
    pub min: i64,
    pub max: i64,
    /// First contiguous runs, inclusive
    pub ranges: Vec<(i64, i64)>,
    pub total_ranges: usize,
    /// Few long runs rather than scattered ids: a mass deletion
    pub appears_sequential: bool,
}

impl IdPattern {
    pub fn from_ids(ids: impl IntoIterator<Item = i64>) -> Option<Self> {
        let ids: BTreeSet<i64> = ids.into_iter().collect();
        let (&min, &max) = (ids.first()?, ids.last()?);

        let mut ranges: Vec<(i64, i64)> = Vec::new();
        for id in &ids {
            match ranges.last_mut() {
                Some((_, end)) if end.checked_add(1) == Some(*id) => *end = *id,
                _ => ranges.push((*id, *id)),
            }
        }
        let total_ranges = ranges.len();
        ranges.truncate(PATTERN_RANGES);
        Some(Self {
            min,
            max,
            ranges,
            total_ranges,
            appears_sequential: total_ranges < ids.len() / 10,
        })
    }
}

/// References to one orphaned owner id in related tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerTrace {
    pub owner_id: i64,
    /// `table.column` -> referencing rows
    pub references: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub generated_at: DateTime<Utc>,
    pub owner_space: BTreeMap<OwnerKind, usize>,
    pub records_scanned: usize,
    pub confidence: ConfidenceCounts,
    pub by_kind: BTreeMap<OwnerKind, usize>,
    /// Records whose owner id sits in more than one owner space
    pub conflicts: usize,
    pub orphaned_owners: Vec<OrphanedOwner>,
    pub orphaned_records: u64,
    pub orphaned_bytes: u64,
    pub id_pattern: Option<IdPattern>,
    pub traces: Vec<OwnerTrace>,
    pub damage: Option<DamageReport>,
    pub omissions: Vec<Omission>,
}

/// Report plus the classified snapshot the planner works from
pub struct Analysis {
    pub report: AnalysisReport,
    pub classifications: Vec<Classification>,
    pub space: OwnerSpace,
}

pub struct Analyzer;

impl Analyzer {
    /// Run the full read-only analysis
    pub fn run(store: &Store, config: &Config, now: DateTime<Utc>) -> Result<Analysis> {
        let (space, mut omissions) =
            OwnerSpace::load(store, &config.schema, &config.classifier)?;

        let mut records = Vec::new();
        for owned in &config.schema.owned_tables {
            match store.snapshot_records(owned) {
                Ok(mut rows) => records.append(&mut rows),
                Err(err @ OrphanScanError::SchemaUnsupported { .. }) => {
                    warn!(table = %owned.table, error = %err, "owned table skipped");
                    omissions.push(Omission::new(format!("snapshot: {}", owned.table), &err));
                }
                Err(err) => return Err(err),
            }
        }
        let records_scanned = records.len();
        let classifications = classify_all(records, &space, config.classifier.workers);

        let mut confidence = ConfidenceCounts::default();
        let mut by_kind: BTreeMap<OwnerKind, usize> = BTreeMap::new();
        let mut conflicts = 0usize;
        let mut orphans: HashMap<i64, (u64, u64, BTreeSet<String>)> = HashMap::new();
        for c in &classifications {
            match c.confidence {
                Confidence::Proven => confidence.proven += 1,
                Confidence::PlausibleUnverified => confidence.plausible_unverified += 1,
                Confidence::Orphaned => confidence.orphaned += 1,
            }
            if let Some(kind) = c.owner_kind {
                *by_kind.entry(kind).or_default() += 1;
            }
            if !c.conflicts.is_empty() {
                conflicts += 1;
            }
            if let (Confidence::Orphaned, Some(owner)) = (c.confidence, c.record.owner_id) {
                let entry = orphans.entry(owner).or_default();
                entry.0 += 1;
                entry.1 += c.record.payload_size;
                entry.2.insert(c.record.table.clone());
            }
        }

        let mut orphaned_owners: Vec<OrphanedOwner> = orphans
            .into_iter()
            .map(|(owner_id, (records, bytes, tables))| OrphanedOwner {
                owner_id,
                records,
                bytes,
                tables: tables.into_iter().collect(),
            })
            .collect();
        orphaned_owners.sort_by(|a, b| b.records.cmp(&a.records).then(a.owner_id.cmp(&b.owner_id)));

        let id_pattern = IdPattern::from_ids(orphaned_owners.iter().map(|o| o.owner_id));
        let sample: Vec<i64> = orphaned_owners
            .iter()
            .take(TRACE_SAMPLE)
            .map(|o| o.owner_id)
            .collect();
        let traces = trace_owners(store, &config.schema.trace_columns, &sample)?;

        let damage = if space.len_of(OwnerKind::Structure).is_none() {
            let err = OrphanScanError::SchemaUnsupported {
                table: config.schema.structures.table.clone(),
                column: None,
            };
            omissions.push(Omission::new("damage detection", &err));
            None
        } else {
            match store.active_owners(&config.schema, &config.damage, now) {
                Ok(owners) => Some(detect(&classifications, &owners, &config.damage)),
                Err(err @ OrphanScanError::SchemaUnsupported { .. }) => {
                    warn!(error = %err, "damage detection skipped");
                    omissions.push(Omission::new("damage detection", &err));
                    None
                }
                Err(err) => return Err(err),
            }
        };
        if let Some(report) = &damage {
            if report.severity > Severity::Normal {
                warn!(
                    severity = %report.severity,
                    zeroed = report.zeroed_owners,
                    active = report.active_owners,
                    "active owners with empty structures"
                );
            }
        }

        let report = AnalysisReport {
            generated_at: now,
            owner_space: space
                .kinds()
                .filter_map(|k| space.len_of(k).map(|n| (k, n)))
                .collect(),
            records_scanned,
            confidence,
            by_kind,
            conflicts,
            orphaned_records: orphaned_owners.iter().map(|o| o.records).sum(),
            orphaned_bytes: orphaned_owners.iter().map(|o| o.bytes).sum(),
            orphaned_owners,
            id_pattern,
            traces,
            damage,
            omissions,
        };
        info!(
            records = report.records_scanned,
            orphaned = report.orphaned_records,
            omissions = report.omissions.len(),
            "analysis complete"
        );
        Ok(Analysis {
            report,
            classifications,
            space,
        })
    }
}

fn trace_owners(store: &Store, columns: &[TraceColumn], owners: &[i64]) -> Result<Vec<OwnerTrace>> {
    let usable: Vec<&TraceColumn> = columns
        .iter()
        .filter(|t| store.catalog().has_column(&t.table, &t.column))
        .collect();
    let mut traces = Vec::with_capacity(owners.len());
    for &owner_id in owners {
        let mut references = BTreeMap::new();
        for trace in &usable {
            let count = store.count_references(&trace.table, &trace.column, &[owner_id])?;
            references.insert(format!("{}.{}", trace.table, trace.column), count);
        }
        debug!(owner_id, found = references.values().sum::<u64>(), "owner traced");
        traces.push(OwnerTrace {
            owner_id,
            references,
        });
    }
    Ok(traces)
}

/// Structure holdings of a healthy run, kept for later damage checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub recorded_at: DateTime<Utc>,
    pub average: f64,
    pub owners_with_structures: usize,
}

impl Baseline {
    /// Only a clean report with positive holdings can serve as a baseline
    pub fn from_report(report: &DamageReport, now: DateTime<Utc>) -> Option<Self> {
        (report.severity == Severity::Normal
            && report.zeroed_owners == 0
            && report.snapshot_average > 0.0)
            .then(|| Self {
                recorded_at: now,
                average: report.snapshot_average,
                owners_with_structures: report.owners_with_structures,
            })
    }

    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::DATA_DIR_NAME)
            .join("baseline.json")
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(sql: &str) -> Store {
        let mut store = Store::open_in_memory().unwrap();
        store.execute_batch(sql).unwrap();
        store
    }

    const SCHEMA: &str = "
        CREATE TABLE characters (id INTEGER PRIMARY KEY, char_name TEXT, guild INTEGER, isAlive INTEGER);
        CREATE TABLE actor_position (id INTEGER PRIMARY KEY, class TEXT);
        CREATE TABLE guilds (guildId INTEGER PRIMARY KEY, name TEXT);
        CREATE TABLE buildings (object_id INTEGER, owner_id INTEGER);
        CREATE TABLE item_inventory (item_id INTEGER, owner_id INTEGER, inv_type INTEGER, template_id INTEGER, data BLOB);
        CREATE TABLE game_events (worldTime INTEGER, eventType INTEGER, player_id INTEGER, target_id INTEGER);
    ";

    #[test]
    fn test_id_pattern_ranges() {
        let pattern = IdPattern::from_ids([5, 1, 2, 3, 9, 10]).unwrap();
        assert_eq!(pattern.min, 1);
        assert_eq!(pattern.max, 10);
        assert_eq!(pattern.ranges, vec![(1, 3), (5, 5), (9, 10)]);
        assert!(!pattern.appears_sequential);

        let sequential = IdPattern::from_ids(1000..1100).unwrap();
        assert_eq!(sequential.total_ranges, 1);
        assert!(sequential.appears_sequential);
        assert!(IdPattern::from_ids([]).is_none());
    }

    #[test]
    fn test_run_on_healthy_store() {
        let store = store(&format!(
            "{SCHEMA}
            INSERT INTO characters VALUES (1, 'a', 0, 1), (2, 'b', 50, 1);
            INSERT INTO actor_position VALUES (100, 'chest'), (101, 'bench');
            INSERT INTO guilds VALUES (50, 'g');
            INSERT INTO buildings VALUES (100, 1), (101, 50);
            INSERT INTO item_inventory VALUES (1, 1, 0, 1, x'00'), (2, 100, 4, 1, x'00'),
                (3, 101, 4, 1, x'00'), (4, 50, 0, 1, x'00'), (5, 0, 0, 1, NULL);"
        ));
        let analysis = Analyzer::run(&store, &Config::default(), Utc::now()).unwrap();
        let report = &analysis.report;
        assert_eq!(report.records_scanned, 5);
        assert_eq!(report.confidence.proven, 4);
        assert_eq!(report.confidence.plausible_unverified, 1);
        assert_eq!(report.confidence.orphaned, 0);
        assert_eq!(report.by_kind.get(&OwnerKind::Structure), Some(&2));
        assert!(report.orphaned_owners.is_empty());
        assert!(report.id_pattern.is_none());
        let damage = report.damage.as_ref().unwrap();
        assert_eq!(damage.severity, Severity::Normal);
        assert_eq!(damage.active_owners, 2);
        assert!(report.omissions.is_empty());
    }

    #[test]
    fn test_run_reports_orphans_and_traces() {
        let store = store(&format!(
            "{SCHEMA}
            INSERT INTO characters VALUES (1, 'a', 0, 1);
            INSERT INTO actor_position VALUES (100, 'chest');
            INSERT INTO buildings VALUES (100, 1);
            INSERT INTO item_inventory VALUES (1, 1, 0, 1, x'00'), (2, 100, 4, 1, x'00'),
                (3, 777, 0, 1, x'0000'), (4, 777, 0, 1, x'00'), (5, 778, 0, 1, x'00');
            INSERT INTO game_events VALUES (1, 86, 777, 0), (2, 86, 0, 777);"
        ));
        let analysis = Analyzer::run(&store, &Config::default(), Utc::now()).unwrap();
        let report = &analysis.report;
        assert_eq!(report.orphaned_records, 3);
        assert_eq!(report.orphaned_bytes, 4);
        assert_eq!(report.orphaned_owners[0].owner_id, 777);
        assert_eq!(report.orphaned_owners[0].records, 2);
        assert_eq!(report.id_pattern.as_ref().unwrap().ranges, vec![(777, 778)]);

        let trace = &report.traces[0];
        assert_eq!(trace.owner_id, 777);
        assert_eq!(trace.references.get("game_events.player_id"), Some(&1));
        assert_eq!(trace.references.get("game_events.target_id"), Some(&1));
        assert_eq!(trace.references.get("buildings.owner_id"), Some(&0));
        assert!(!trace.references.contains_key("properties.object_id"));
    }

    #[test]
    fn test_run_degrades_without_registries() {
        let store = store(
            "CREATE TABLE characters (id INTEGER PRIMARY KEY);
             CREATE TABLE item_inventory (item_id INTEGER, owner_id INTEGER);
             INSERT INTO characters VALUES (1);
             INSERT INTO item_inventory VALUES (1, 1), (2, 100);",
        );
        let config = Config::default();
        let analysis = Analyzer::run(&store, &config, Utc::now()).unwrap();
        let report = &analysis.report;
        assert_eq!(report.confidence.proven, 1);
        assert_eq!(report.confidence.plausible_unverified, 1);
        assert_eq!(report.confidence.orphaned, 0);
        assert!(report.damage.is_none());
        let scopes: Vec<_> = report.omissions.iter().map(|o| o.scope.as_str()).collect();
        assert!(scopes.contains(&"owner space: structure"));
        assert!(scopes.contains(&"owner space: guild"));
        assert!(scopes.contains(&"damage detection"));

        let plan = crate::cleanup::plan_orphan_cleanup(
            &analysis.classifications,
            &analysis.space,
            &config.schema.owned_tables,
        );
        assert!(plan.is_empty());
        assert_eq!(plan.omissions[0].scope, "orphan plan");
    }

    #[test]
    fn test_baseline_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("baseline.json");
        assert!(Baseline::load(&path).unwrap().is_none());
        let baseline = Baseline {
            recorded_at: Utc::now(),
            average: 3.5,
            owners_with_structures: 4,
        };
        baseline.save(&path).unwrap();
        assert_eq!(Baseline::load(&path).unwrap(), Some(baseline));
    }
}
