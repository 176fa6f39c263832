//! Plan builders for orphan and event-retention cleanup

use super::{CleanupAction, CleanupPlan, Cutoff, Predicate, RiskTier};
use crate::config::{EventTableConfig, OwnedTableConfig};
use crate::db::{Omission, Store};
use crate::error::{OrphanScanError, Result};
use crate::ownership::{Classification, Confidence, OwnerSpace};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Event retention policy: delete events older than `max_age`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRetention {
    pub max_age: Duration,
    /// Restrict deletion to these event types (empty = every type)
    pub event_types: Vec<i64>,
}

impl EventRetention {
    pub fn days(days: i64) -> Self {
        Self {
            max_age: Duration::days(days),
            event_types: Vec::new(),
        }
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = i64>) -> Self {
        self.event_types = types.into_iter().collect();
        self.event_types.sort_unstable();
        self.event_types.dedup();
        self
    }
}

#[derive(Default)]
struct TableTally {
    owners: BTreeSet<i64>,
    rows: u64,
    bytes: u64,
}

/// One action per table holding `Orphaned` records.
///
/// Counts and bytes come from the orphaned set only; `PlausibleUnverified`
/// and `Proven` records never contribute, and the generated predicate binds
/// the exact orphaned owner ids. An owner space missing a required registry
/// yields an empty plan with an omission.
pub fn plan_orphan_cleanup(
    classifications: &[Classification],
    space: &OwnerSpace,
    owned_tables: &[OwnedTableConfig],
) -> CleanupPlan {
    if !space.is_complete() {
        let missing: Vec<&str> = space.missing_kinds().iter().map(|k| k.as_str()).collect();
        let err = OrphanScanError::SchemaUnsupported {
            table: format!("{} registry", missing.join("/")),
            column: None,
        };
        warn!(missing = ?missing, "owner space incomplete, orphan cleanup not planned");
        return CleanupPlan::new(Vec::new(), vec![Omission::new("orphan plan", &err)]);
    }

    let mut tallies: BTreeMap<&str, TableTally> = BTreeMap::new();
    for c in classifications {
        if c.confidence != Confidence::Orphaned {
            continue;
        }
        let Some(owner) = c.record.owner_id else {
            continue;
        };
        let tally = tallies.entry(c.record.table.as_str()).or_default();
        tally.owners.insert(owner);
        tally.rows += 1;
        tally.bytes += c.record.payload_size;
    }

    let guards = space.sources();
    let registries: Vec<String> = space.kinds().map(|k| k.to_string()).collect();
    let mut actions = Vec::new();
    let mut omissions = Vec::new();
    for (table, tally) in tallies {
        let Some(config) = owned_tables
            .iter()
            .find(|t| t.table.eq_ignore_ascii_case(table))
        else {
            let err = OrphanScanError::SchemaUnsupported {
                table: table.to_string(),
                column: None,
            };
            warn!(table, "orphaned records from an unconfigured table, not planned");
            omissions.push(Omission::new(format!("orphan plan: {}", table), &err));
            continue;
        };

        let justification = format!(
            "{} rows in {} belong to {} owner ids found in no {} registry and outside transient ranges",
            tally.rows,
            table,
            tally.owners.len(),
            registries.join("/"),
        );
        debug!(table, rows = tally.rows, owners = tally.owners.len(), "orphan action planned");
        actions.push(CleanupAction {
            table: config.table.clone(),
            predicate: Predicate::OrphanedOwners {
                owner_column: config.owner_column.clone(),
                owner_ids: tally.owners.into_iter().collect(),
                guards: guards.clone(),
            },
            rows: tally.rows,
            estimated_bytes: tally.bytes,
            risk: config.risk,
            justification,
        });
    }

    let plan = CleanupPlan::new(actions, omissions);
    info!(
        actions = plan.len(),
        rows = plan.total_rows(),
        "orphan cleanup planned"
    );
    plan
}

/// One action deleting events older than the retention window.
///
/// Independent of ownership. A missing table or column, or a type filter
/// the table cannot honour, yields an empty plan with an omission.
pub fn plan_event_cleanup(
    store: &Store,
    events: &EventTableConfig,
    retention: &EventRetention,
    now: DateTime<Utc>,
) -> Result<CleanupPlan> {
    if retention.max_age < Duration::zero() {
        return Err(OrphanScanError::InvalidInput(format!(
            "retention must not be negative, got {} days",
            retention.max_age.num_days()
        )));
    }

    let format = match store.resolve_time_format(events) {
        Ok(format) => format,
        Err(err @ OrphanScanError::SchemaUnsupported { .. }) => {
            warn!(error = %err, "event cleanup unsupported by this store");
            return Ok(CleanupPlan::new(
                Vec::new(),
                vec![Omission::new("event plan", &err)],
            ));
        }
        Err(err) => return Err(err),
    };
    if !retention.event_types.is_empty()
        && !store.catalog().has_column(&events.table, &events.type_column)
    {
        let err = OrphanScanError::SchemaUnsupported {
            table: events.table.clone(),
            column: Some(events.type_column.clone()),
        };
        warn!(error = %err, "event type filter cannot be applied");
        return Ok(CleanupPlan::new(
            Vec::new(),
            vec![Omission::new("event plan", &err)],
        ));
    }

    let cutoff_at = now - retention.max_age;
    let mut action = CleanupAction {
        table: events.table.clone(),
        predicate: Predicate::OlderThan {
            time_column: events.time_column.clone(),
            cutoff: Cutoff::for_format(format, cutoff_at),
            type_column: events.type_column.clone(),
            event_types: retention.event_types.clone(),
        },
        rows: 0,
        estimated_bytes: 0,
        risk: RiskTier::EventLog,
        justification: String::new(),
    };

    let rows = action.count_live(store)?;
    if rows == 0 {
        info!(table = %events.table, "no events older than the retention window");
        return Ok(CleanupPlan::default());
    }

    let row_bytes = store.estimate_row_bytes(&events.table)?;
    action.rows = rows;
    action.estimated_bytes = (rows as f64 * row_bytes).round() as u64;
    action.justification = if retention.event_types.is_empty() {
        format!(
            "{} events older than {} days (before {})",
            rows,
            retention.max_age.num_days(),
            cutoff_at.to_rfc3339()
        )
    } else {
        format!(
            "{} events of types {:?} older than {} days (before {})",
            rows,
            retention.event_types,
            retention.max_age.num_days(),
            cutoff_at.to_rfc3339()
        )
    };
    info!(table = %events.table, rows, "event cleanup planned");
    Ok(CleanupPlan::new(vec![action], Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ownership::{classify_all, OwnerKind, Record};
    use chrono::TimeZone;

    fn record(id: i64, owner: Option<i64>, table: &str) -> Record {
        Record {
            id,
            owner_id: owner,
            payload_size: 100,
            table: table.into(),
        }
    }

    #[test]
    fn test_orphan_plan_counts_only_orphaned() {
        let space = OwnerSpace::new(vec![crate::config::IdRange { start: 500, end: 599 }])
            .with_kind(OwnerKind::Character, [1])
            .with_kind(OwnerKind::Structure, [10]);
        let records = vec![
            record(1, Some(1), "item_inventory"),
            record(2, Some(10), "item_inventory"),
            record(3, Some(77), "item_inventory"),
            record(4, Some(77), "item_inventory"),
            record(5, Some(78), "item_inventory"),
            record(6, Some(550), "item_inventory"),
            record(7, None, "item_inventory"),
            record(8, Some(0), "item_inventory"),
        ];
        let classified = classify_all(records, &space, 1);
        let config = Config::default();
        let plan = plan_orphan_cleanup(&classified, &space, &config.schema.owned_tables);

        assert_eq!(plan.len(), 1);
        let action = &plan.actions()[0];
        assert_eq!(action.rows, 3);
        assert_eq!(action.estimated_bytes, 300);
        match &action.predicate {
            Predicate::OrphanedOwners { owner_ids, .. } => assert_eq!(owner_ids, &vec![77, 78]),
            other => panic!("unexpected predicate {:?}", other),
        }
    }

    #[test]
    fn test_orphan_plan_empty_when_nothing_orphaned() {
        let space = OwnerSpace::new(vec![]).with_kind(OwnerKind::Character, [1]);
        let classified = classify_all(vec![record(1, Some(1), "item_inventory")], &space, 1);
        let plan = plan_orphan_cleanup(&classified, &space, &Config::default().schema.owned_tables);
        assert!(plan.is_empty());
        assert!(plan.omissions.is_empty());
    }

    #[test]
    fn test_orphan_plan_refused_for_incomplete_space() {
        let space = OwnerSpace::new(vec![])
            .with_kind(OwnerKind::Character, [1])
            .with_missing(OwnerKind::Structure);
        let orphaned = Classification {
            record: record(1, Some(100), "item_inventory"),
            owner_kind: None,
            confidence: Confidence::Orphaned,
            conflicts: Vec::new(),
        };
        let plan = plan_orphan_cleanup(&[orphaned], &space, &Config::default().schema.owned_tables);
        assert!(plan.is_empty());
        assert_eq!(plan.omissions.len(), 1);
        assert_eq!(plan.omissions[0].scope, "orphan plan");
        assert!(plan.omissions[0].reason.contains("structure"));
    }

    #[test]
    fn test_orphan_plan_skips_unconfigured_tables() {
        let space = OwnerSpace::new(vec![]);
        let classified = classify_all(vec![record(1, Some(5), "mystery")], &space, 1);
        let plan = plan_orphan_cleanup(&classified, &space, &Config::default().schema.owned_tables);
        assert!(plan.is_empty());
        assert_eq!(plan.omissions.len(), 1);
    }

    #[test]
    fn test_event_plan_degrades_without_table() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let plan = plan_event_cleanup(
            &store,
            &EventTableConfig::default(),
            &EventRetention::days(30),
            now,
        )
        .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.omissions.len(), 1);
    }

    #[test]
    fn test_event_plan_rejects_negative_retention() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE game_events (worldTime INTEGER, eventType INTEGER);
                 INSERT INTO game_events VALUES (1, 1);",
            )
            .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let err = plan_event_cleanup(
            &store,
            &EventTableConfig::default(),
            &EventRetention::days(-1),
            now,
        )
        .unwrap_err();
        assert!(matches!(err, OrphanScanError::InvalidInput(_)));
    }

    #[test]
    fn test_event_plan_type_filter() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE game_events (worldTime INTEGER, eventType INTEGER, payload TEXT);",
            )
            .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        for (age, kind) in [(40, 86), (40, 92), (50, 86), (1, 86)] {
            let ts = (now - Duration::days(age)).timestamp();
            store
                .conn
                .execute(
                    "INSERT INTO game_events VALUES (?1, ?2, 'x')",
                    rusqlite::params![ts, kind],
                )
                .unwrap();
        }

        let retention = EventRetention::days(30).with_types([86, 86]);
        assert_eq!(retention.event_types, vec![86]);
        let plan = plan_event_cleanup(&store, &EventTableConfig::default(), &retention, now).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.actions()[0].rows, 2);
        assert_eq!(plan.actions()[0].risk, RiskTier::EventLog);
        assert!(plan.actions()[0].estimated_bytes > 0);
    }

    #[test]
    fn test_event_plan_iso_timestamps() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE events (created_at TEXT, eventType INTEGER);
                 INSERT INTO events VALUES ('2024-01-01T10:00:00Z', 1);
                 INSERT INTO events VALUES ('2024-05-31 10:00:00', 1);",
            )
            .unwrap();
        let events = EventTableConfig {
            table: "events".into(),
            time_column: "created_at".into(),
            ..EventTableConfig::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let plan = plan_event_cleanup(&store, &events, &EventRetention::days(30), now).unwrap();
        assert_eq!(plan.total_rows(), 1);
        match &plan.actions()[0].predicate {
            Predicate::OlderThan { cutoff, .. } => {
                assert_eq!(cutoff, &Cutoff::Iso("2024-05-02 00:00:00".into()))
            }
            other => panic!("unexpected predicate {:?}", other),
        }
    }
}
