//! Ownership classification
//!
//! Decides, per owner id, which owner kind a record belongs to. The rule is
//! asymmetric: an id is only `Orphaned` when it is absent from every known
//! owner space *and* outside every transient-id range, and only when every
//! required owner registry could be read. Anything we cannot prove unowned
//! is kept.

mod space;

pub use space::{OwnerSource, OwnerSpace};

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Kinds of entity that may own records, in classification priority.
///
/// Adding a kind means adding a variant, its place in `PRIORITY` and its
/// registry in `OwnerKind::registry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    Character,
    Structure,
    Guild,
}

impl OwnerKind {
    pub const PRIORITY: [OwnerKind; 3] = [OwnerKind::Character, OwnerKind::Structure, OwnerKind::Guild];

    pub fn priority(&self) -> usize {
        Self::PRIORITY
            .iter()
            .position(|k| k == self)
            .unwrap_or(usize::MAX)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Character => "character",
            OwnerKind::Structure => "structure",
            OwnerKind::Guild => "guild",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state outcome; only `Orphaned` is eligible for deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Proven,
    PlausibleUnverified,
    Orphaned,
}

/// A row of an owned table, captured when the analysis starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub id: i64,
    pub owner_id: Option<i64>,
    /// Estimated stored bytes
    pub payload_size: u64,
    pub table: String,
}

/// Classification of a bare owner id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub owner_kind: Option<OwnerKind>,
    pub confidence: Confidence,
    /// Lower-priority kinds that also contain the id
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<OwnerKind>,
}

impl Verdict {
    fn plausible() -> Self {
        Self {
            owner_kind: None,
            confidence: Confidence::PlausibleUnverified,
            conflicts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub record: Record,
    pub owner_kind: Option<OwnerKind>,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<OwnerKind>,
}

impl Classification {
    pub fn is_orphaned(&self) -> bool {
        self.confidence == Confidence::Orphaned
    }
}

/// Classify one owner id against a fixed owner space
pub fn classify(owner_id: Option<i64>, space: &OwnerSpace) -> Verdict {
    let id = match owner_id {
        Some(id) if id != 0 => id,
        _ => return Verdict::plausible(),
    };

    let mut matches = space.kinds_containing(id);
    if let Some(kind) = matches.next() {
        let conflicts: Vec<OwnerKind> = matches.collect();
        if !conflicts.is_empty() {
            warn!(
                owner_id = id,
                resolved = %kind,
                also_in = ?conflicts,
                "classification conflict: id present in several owner spaces"
            );
        }
        return Verdict {
            owner_kind: Some(kind),
            confidence: Confidence::Proven,
            conflicts,
        };
    }

    // An unread required registry could hold the id
    if space.is_transient(id) || !space.is_complete() {
        return Verdict::plausible();
    }

    Verdict {
        owner_kind: None,
        confidence: Confidence::Orphaned,
        conflicts: Vec::new(),
    }
}

pub fn classify_record(record: Record, space: &OwnerSpace) -> Classification {
    let verdict = classify(record.owner_id, space);
    Classification {
        record,
        owner_kind: verdict.owner_kind,
        confidence: verdict.confidence,
        conflicts: verdict.conflicts,
    }
}

/// Classify a snapshot, fanning out over `workers` threads.
///
/// Output order matches input order. `workers == 0` uses the available
/// parallelism.
pub fn classify_all(records: Vec<Record>, space: &OwnerSpace, workers: usize) -> Vec<Classification> {
    const MIN_CHUNK: usize = 4096;

    let workers = if workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        workers
    };
    if workers <= 1 || records.len() <= MIN_CHUNK {
        return records
            .into_iter()
            .map(|r| classify_record(r, space))
            .collect();
    }

    let chunk_size = records.len().div_ceil(workers).max(MIN_CHUNK);
    let mut chunks: Vec<Vec<Record>> = Vec::new();
    let mut rest = records;
    while rest.len() > chunk_size {
        let tail = rest.split_off(chunk_size);
        chunks.push(rest);
        rest = tail;
    }
    chunks.push(rest);

    std::thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .into_iter()
                        .map(|r| classify_record(r, space))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(part) => part,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdRange;
    use proptest::prelude::*;

    fn space() -> OwnerSpace {
        OwnerSpace::new(vec![IdRange {
            start: 900_000,
            end: 999_999,
        }])
        .with_kind(OwnerKind::Character, [1, 2])
        .with_kind(OwnerKind::Structure, [10, 11])
        .with_kind(OwnerKind::Guild, [20])
    }

    fn record(id: i64, owner: Option<i64>) -> Record {
        Record {
            id,
            owner_id: owner,
            payload_size: 10,
            table: "item_inventory".into(),
        }
    }

    #[test]
    fn test_each_kind_is_proven() {
        let space = space();
        assert_eq!(classify(Some(1), &space).owner_kind, Some(OwnerKind::Character));
        assert_eq!(classify(Some(10), &space).owner_kind, Some(OwnerKind::Structure));
        assert_eq!(classify(Some(20), &space).owner_kind, Some(OwnerKind::Guild));
        assert_eq!(classify(Some(20), &space).confidence, Confidence::Proven);
    }

    #[test]
    fn test_null_and_zero_are_plausible() {
        let space = space();
        assert_eq!(classify(None, &space).confidence, Confidence::PlausibleUnverified);
        assert_eq!(classify(Some(0), &space).confidence, Confidence::PlausibleUnverified);
    }

    #[test]
    fn test_transient_range_is_never_orphaned() {
        let space = space();
        assert_eq!(
            classify(Some(950_000), &space).confidence,
            Confidence::PlausibleUnverified
        );
        assert_eq!(classify(Some(899_999), &space).confidence, Confidence::Orphaned);
        assert_eq!(classify(Some(1_000_000), &space).confidence, Confidence::Orphaned);
    }

    #[test]
    fn test_conflict_resolves_to_highest_priority() {
        let space = space().with_kind(OwnerKind::Structure, [1, 10]);
        let verdict = classify(Some(1), &space);
        assert_eq!(verdict.owner_kind, Some(OwnerKind::Character));
        assert_eq!(verdict.confidence, Confidence::Proven);
        assert_eq!(verdict.conflicts, vec![OwnerKind::Structure]);
    }

    #[test]
    fn test_empty_space_only_orphans_outside_transient() {
        let space = OwnerSpace::new(vec![IdRange { start: i64::MIN, end: -1 }]);
        assert_eq!(classify(Some(-5), &space).confidence, Confidence::PlausibleUnverified);
        assert_eq!(classify(Some(5), &space).confidence, Confidence::Orphaned);
    }

    #[test]
    fn test_incomplete_space_never_orphans() {
        let space = OwnerSpace::new(vec![])
            .with_kind(OwnerKind::Character, [1])
            .with_missing(OwnerKind::Structure);
        assert_eq!(classify(Some(1), &space).confidence, Confidence::Proven);
        assert_eq!(
            classify(Some(100), &space).confidence,
            Confidence::PlausibleUnverified
        );
    }

    #[test]
    fn test_classify_all_preserves_order_across_workers() {
        let space = space();
        let records: Vec<Record> = (0..20_000).map(|i| record(i, Some(i % 25))).collect();
        let serial = classify_all(records.clone(), &space, 1);
        let parallel = classify_all(records, &space, 4);
        assert_eq!(serial, parallel);
        assert_eq!(parallel[3].record.id, 3);
    }

    proptest! {
        #[test]
        fn prop_single_space_ids_are_proven(id in 1i64..100_000, kind_idx in 0usize..3) {
            let kind = OwnerKind::PRIORITY[kind_idx];
            let space = OwnerSpace::new(vec![]).with_kind(kind, [id]);
            let verdict = classify(Some(id), &space);
            prop_assert_eq!(verdict.owner_kind, Some(kind));
            prop_assert_eq!(verdict.confidence, Confidence::Proven);
            prop_assert!(verdict.conflicts.is_empty());
        }

        #[test]
        fn prop_unknown_ids_follow_transient_rule(id in 1i64..2_000_000) {
            let space = space();
            prop_assume!(space.kinds_containing(id).next().is_none());
            let verdict = classify(Some(id), &space);
            if (900_000..=999_999).contains(&id) {
                prop_assert_eq!(verdict.confidence, Confidence::PlausibleUnverified);
            } else {
                prop_assert_eq!(verdict.confidence, Confidence::Orphaned);
            }
        }

        #[test]
        fn prop_classification_is_deterministic(ids in proptest::collection::vec(0i64..50, 1..200)) {
            let space = space();
            let records: Vec<Record> = ids.iter().enumerate().map(|(i, o)| record(i as i64, Some(*o))).collect();
            let mut reversed = records.clone();
            reversed.reverse();
            let forward = classify_all(records, &space, 1);
            let mut backward = classify_all(reversed, &space, 1);
            backward.reverse();
            prop_assert_eq!(forward, backward);
        }
    }
}
