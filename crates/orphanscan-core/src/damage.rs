//! Damage detection
//!
//! A naive `owner_id NOT IN characters` cleanup deletes everything stored in
//! chests and benches, because those items are owned by the placed
//! structure rather than the character. The signature it leaves behind is
//! active characters whose structures still exist but hold nothing. This
//! module looks for that signature. It is advisory only.

use crate::config::DamagePolicy;
use crate::ownership::{Classification, Confidence, OwnerKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A currently active character and the structures it can reach
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveOwner {
    pub character_id: i64,
    pub guild_id: Option<i64>,
    /// Object ids of buildings owned by the character or its guild
    pub structures: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineSource {
    /// Supplied by configuration or a saved earlier run
    Recorded,
    /// Derived from the snapshot being analysed
    Snapshot,
}

/// Holdings of one active owner whose structures came up empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlaggedOwner {
    pub character_id: i64,
    pub structures_owned: usize,
    pub structure_records: u64,
    /// Records still held personally (inventory, hotbar, equipment)
    pub character_records: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DamageReport {
    pub severity: Severity,
    pub active_owners: usize,
    /// Active owners that own at least one structure
    pub owners_with_structures: usize,
    pub zeroed_owners: usize,
    /// `zeroed_owners / active_owners`
    pub zeroed_ratio: f64,
    /// Mean structure-owned records per owner with structures, this snapshot
    pub snapshot_average: f64,
    pub baseline_average: f64,
    pub baseline_source: BaselineSource,
    pub flagged: Vec<FlaggedOwner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Severity for a zeroed-owner ratio; both thresholds are strict
pub fn severity_for(ratio: f64, baseline_average: f64, policy: &DamagePolicy) -> Severity {
    if baseline_average <= 0.0 {
        return Severity::Normal;
    }
    if ratio > policy.critical_ratio {
        Severity::Critical
    } else if ratio > policy.warning_ratio {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

/// Compare current holdings of active owners against the expected baseline
pub fn detect(
    classifications: &[Classification],
    owners: &[ActiveOwner],
    policy: &DamagePolicy,
) -> DamageReport {
    let mut by_structure: HashMap<i64, u64> = HashMap::new();
    let mut by_character: HashMap<i64, u64> = HashMap::new();
    for c in classifications {
        if c.confidence != Confidence::Proven {
            continue;
        }
        let Some(owner) = c.record.owner_id else {
            continue;
        };
        match c.owner_kind {
            Some(OwnerKind::Structure) => *by_structure.entry(owner).or_default() += 1,
            Some(OwnerKind::Character) => *by_character.entry(owner).or_default() += 1,
            _ => {}
        }
    }

    let mut owners_with_structures = 0usize;
    let mut total_holdings = 0u64;
    let mut flagged = Vec::new();
    for owner in owners {
        if owner.structures.is_empty() {
            continue;
        }
        owners_with_structures += 1;
        let holdings: u64 = owner
            .structures
            .iter()
            .map(|s| by_structure.get(s).copied().unwrap_or(0))
            .sum();
        total_holdings += holdings;
        if holdings == 0 {
            flagged.push(FlaggedOwner {
                character_id: owner.character_id,
                structures_owned: owner.structures.len(),
                structure_records: 0,
                character_records: by_character
                    .get(&owner.character_id)
                    .copied()
                    .unwrap_or(0),
            });
        }
    }

    let snapshot_average = if owners_with_structures == 0 {
        0.0
    } else {
        total_holdings as f64 / owners_with_structures as f64
    };
    let (baseline_average, baseline_source) = match policy.baseline_average {
        Some(avg) => (avg, BaselineSource::Recorded),
        None => (snapshot_average, BaselineSource::Snapshot),
    };
    let zeroed_ratio = if owners.is_empty() {
        0.0
    } else {
        flagged.len() as f64 / owners.len() as f64
    };

    let (severity, note) = if owners.len() < policy.min_active_owners {
        (
            Severity::Normal,
            Some(format!(
                "only {} active owners, below the minimum of {}",
                owners.len(),
                policy.min_active_owners
            )),
        )
    } else if baseline_average <= 0.0 && !flagged.is_empty() {
        (
            Severity::Normal,
            Some("no positive baseline; record one from a healthy run".to_string()),
        )
    } else {
        (severity_for(zeroed_ratio, baseline_average, policy), None)
    };

    flagged.sort_by_key(|f| f.character_id);
    DamageReport {
        severity,
        active_owners: owners.len(),
        owners_with_structures,
        zeroed_owners: flagged.len(),
        zeroed_ratio,
        snapshot_average,
        baseline_average,
        baseline_source,
        flagged,
        note,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::{classify_record, OwnerSpace, Record};

    fn owner(id: i64, structures: &[i64]) -> ActiveOwner {
        ActiveOwner {
            character_id: id,
            guild_id: None,
            structures: structures.to_vec(),
        }
    }

    fn classified(space: &OwnerSpace, owners: &[i64]) -> Vec<Classification> {
        owners
            .iter()
            .enumerate()
            .map(|(i, o)| {
                classify_record(
                    Record {
                        id: i as i64,
                        owner_id: Some(*o),
                        payload_size: 0,
                        table: "item_inventory".into(),
                    },
                    space,
                )
            })
            .collect()
    }

    #[test]
    fn test_healthy_store_is_normal() {
        let space = OwnerSpace::new(vec![])
            .with_kind(OwnerKind::Character, [1, 2])
            .with_kind(OwnerKind::Structure, [100, 200]);
        let records = classified(&space, &[1, 2, 100, 100, 200]);
        let report = detect(
            &records,
            &[owner(1, &[100]), owner(2, &[200])],
            &DamagePolicy::default(),
        );
        assert_eq!(report.severity, Severity::Normal);
        assert_eq!(report.zeroed_owners, 0);
        assert_eq!(report.snapshot_average, 1.5);
    }

    #[test]
    fn test_owners_without_structures_are_not_flagged() {
        let space = OwnerSpace::new(vec![]).with_kind(OwnerKind::Character, [1]);
        let records = classified(&space, &[1]);
        let report = detect(&records, &[owner(1, &[])], &DamagePolicy::default());
        assert_eq!(report.owners_with_structures, 0);
        assert!(report.flagged.is_empty());
    }

    #[test]
    fn test_flagged_owner_keeps_personal_records() {
        let space = OwnerSpace::new(vec![])
            .with_kind(OwnerKind::Character, [1, 2])
            .with_kind(OwnerKind::Structure, [100, 200]);
        let records = classified(&space, &[1, 1, 2, 200, 200]);
        let report = detect(
            &records,
            &[owner(1, &[100]), owner(2, &[200])],
            &DamagePolicy::default(),
        );
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].character_id, 1);
        assert_eq!(report.flagged[0].character_records, 2);
        assert_eq!(report.zeroed_ratio, 0.5);
        assert_eq!(report.severity, Severity::Critical);
    }

    #[test]
    fn test_total_wipe_needs_recorded_baseline() {
        let space = OwnerSpace::new(vec![])
            .with_kind(OwnerKind::Character, [1])
            .with_kind(OwnerKind::Structure, [100]);
        let records = classified(&space, &[1]);
        let owners = [owner(1, &[100])];

        let report = detect(&records, &owners, &DamagePolicy::default());
        assert_eq!(report.severity, Severity::Normal);
        assert!(report.note.is_some());

        let policy = DamagePolicy {
            baseline_average: Some(40.0),
            ..DamagePolicy::default()
        };
        let report = detect(&records, &owners, &policy);
        assert_eq!(report.baseline_source, BaselineSource::Recorded);
        assert_eq!(report.severity, Severity::Critical);
    }

    #[test]
    fn test_below_min_active_owners_is_normal() {
        let policy = DamagePolicy {
            min_active_owners: 5,
            baseline_average: Some(10.0),
            ..DamagePolicy::default()
        };
        let report = detect(&[], &[owner(1, &[100])], &policy);
        assert_eq!(report.severity, Severity::Normal);
        assert_eq!(report.zeroed_owners, 1);
    }

    #[test]
    fn test_severity_thresholds_are_strict() {
        let policy = DamagePolicy::default();
        assert_eq!(severity_for(0.05, 1.0, &policy), Severity::Normal);
        assert_eq!(severity_for(0.0501, 1.0, &policy), Severity::Warning);
        assert_eq!(severity_for(0.10, 1.0, &policy), Severity::Warning);
        assert_eq!(severity_for(0.1001, 1.0, &policy), Severity::Critical);
        assert_eq!(severity_for(0.9, 0.0, &policy), Severity::Normal);
    }
}
