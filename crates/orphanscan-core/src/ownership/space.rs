//! Owner id spaces

use super::OwnerKind;
use crate::config::{ClassifierConfig, IdRange, RegistryConfig, SchemaConfig};
use crate::db::{Omission, SchemaCatalog, Store};
use crate::error::{OrphanScanError, Result};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

/// Where the ids of one owner kind were read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerSource {
    pub kind: OwnerKind,
    pub table: String,
    pub id_column: String,
}

#[derive(Debug, Clone)]
struct KindSpace {
    kind: OwnerKind,
    ids: HashSet<i64>,
    source: Option<OwnerSource>,
}

/// Every legitimate owner id, grouped by kind in classification priority.
///
/// Built once per analysis run and read-only afterwards; it is `Sync`, so
/// classification can fan out across threads.
#[derive(Debug, Clone, Default)]
pub struct OwnerSpace {
    kinds: Vec<KindSpace>,
    transient: Vec<IdRange>,
    /// Required kinds whose registry could not be read
    missing: Vec<OwnerKind>,
}

impl OwnerSpace {
    pub fn new(transient: Vec<IdRange>) -> Self {
        Self {
            kinds: Vec::new(),
            transient,
            missing: Vec::new(),
        }
    }

    /// Record a required kind whose ids are unknown
    pub fn with_missing(mut self, kind: OwnerKind) -> Self {
        self.mark_missing(kind);
        self
    }

    fn mark_missing(&mut self, kind: OwnerKind) {
        if !self.missing.contains(&kind) {
            self.missing.push(kind);
            self.missing.sort_by_key(|k| k.priority());
        }
    }

    /// Register the ids of one kind, keeping kinds in priority order
    pub fn with_kind(mut self, kind: OwnerKind, ids: impl IntoIterator<Item = i64>) -> Self {
        self.insert(kind, ids.into_iter().collect(), None);
        self
    }

    fn insert(&mut self, kind: OwnerKind, ids: HashSet<i64>, source: Option<OwnerSource>) {
        self.kinds.retain(|k| k.kind != kind);
        self.kinds.push(KindSpace { kind, ids, source });
        self.kinds.sort_by_key(|k| k.kind.priority());
    }

    /// Build the space from the live registries.
    ///
    /// A registry missing from this store version is skipped and reported
    /// as an omission. When the skipped kind is one of
    /// `classifier.required_owner_kinds` the space is incomplete and nothing
    /// classified against it can be `Orphaned`.
    pub fn load(
        store: &Store,
        schema: &SchemaConfig,
        classifier: &ClassifierConfig,
    ) -> Result<(Self, Vec<Omission>)> {
        let mut space = Self::new(classifier.transient_ranges.clone());
        let mut omissions = Vec::new();

        for kind in OwnerKind::PRIORITY {
            let Some(registry) = kind.registry(schema, store.catalog()) else {
                let err = OrphanScanError::SchemaUnsupported {
                    table: kind.default_table(schema),
                    column: None,
                };
                warn!(kind = %kind, "owner registry not present, skipping");
                omissions.push(Omission::new(format!("owner space: {}", kind), &err));
                if classifier.required_owner_kinds.contains(&kind) {
                    space.mark_missing(kind);
                }
                continue;
            };
            match store.id_set(&registry) {
                Ok(ids) => {
                    info!(kind = %kind, table = %registry.table, ids = ids.len(), "owner space loaded");
                    let source = OwnerSource {
                        kind,
                        table: registry.table,
                        id_column: registry.id_column,
                    };
                    space.insert(kind, ids, Some(source));
                }
                Err(err @ OrphanScanError::SchemaUnsupported { .. }) => {
                    warn!(kind = %kind, error = %err, "owner registry unusable, skipping");
                    omissions.push(Omission::new(format!("owner space: {}", kind), &err));
                    if classifier.required_owner_kinds.contains(&kind) {
                        space.mark_missing(kind);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok((space, omissions))
    }

    /// Registered kinds in priority order
    pub fn kinds(&self) -> impl Iterator<Item = OwnerKind> + '_ {
        self.kinds.iter().map(|k| k.kind)
    }

    pub fn len_of(&self, kind: OwnerKind) -> Option<usize> {
        self.kinds
            .iter()
            .find(|k| k.kind == kind)
            .map(|k| k.ids.len())
    }

    /// Kinds whose id space contains `id`, in priority order
    pub fn kinds_containing(&self, id: i64) -> impl Iterator<Item = OwnerKind> + '_ {
        self.kinds
            .iter()
            .filter(move |k| k.ids.contains(&id))
            .map(|k| k.kind)
    }

    /// Required kinds that failed to load, in priority order
    pub fn missing_kinds(&self) -> &[OwnerKind] {
        &self.missing
    }

    /// Whether every required registry was read
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn is_transient(&self, id: i64) -> bool {
        self.transient.iter().any(|r| r.contains(id))
    }

    /// Registries the space was loaded from (empty for hand-built spaces)
    pub fn sources(&self) -> Vec<OwnerSource> {
        self.kinds.iter().filter_map(|k| k.source.clone()).collect()
    }
}

impl OwnerKind {
    /// Table/column holding this kind's ids in the given store
    pub fn registry(&self, schema: &SchemaConfig, catalog: &SchemaCatalog) -> Option<RegistryConfig> {
        let registry = match self {
            OwnerKind::Character => RegistryConfig {
                table: catalog.first_existing(&schema.character_tables)?.to_string(),
                id_column: schema.character_id_column.clone(),
            },
            OwnerKind::Structure => schema.structures.clone(),
            OwnerKind::Guild => schema.guilds.clone(),
        };
        catalog
            .table_exists(&registry.table)
            .then_some(registry)
    }

    fn default_table(&self, schema: &SchemaConfig) -> String {
        match self {
            OwnerKind::Character => schema.character_tables.join("|"),
            OwnerKind::Structure => schema.structures.table.clone(),
            OwnerKind::Guild => schema.guilds.table.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_with_kind_keeps_priority_order() {
        let space = OwnerSpace::new(vec![])
            .with_kind(OwnerKind::Guild, [3])
            .with_kind(OwnerKind::Character, [1])
            .with_kind(OwnerKind::Structure, [2]);
        let kinds: Vec<_> = space.kinds().collect();
        assert_eq!(
            kinds,
            vec![OwnerKind::Character, OwnerKind::Structure, OwnerKind::Guild]
        );
    }

    #[test]
    fn test_load_skips_missing_registries() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE players (id INTEGER PRIMARY KEY);
                 CREATE TABLE actor_position (id INTEGER PRIMARY KEY, class TEXT);
                 INSERT INTO players VALUES (1), (2);
                 INSERT INTO actor_position VALUES (10, 'BP_Chest');",
            )
            .unwrap();
        let config = Config::default();

        let (space, omissions) =
            OwnerSpace::load(&store, &config.schema, &config.classifier).unwrap();
        assert_eq!(space.len_of(OwnerKind::Character), Some(2));
        assert_eq!(space.len_of(OwnerKind::Structure), Some(1));
        assert_eq!(space.len_of(OwnerKind::Guild), None);
        assert_eq!(omissions.len(), 1);
        assert!(omissions[0].scope.contains("guild"));
        assert_eq!(space.missing_kinds(), &[OwnerKind::Guild]);
        assert!(!space.is_complete());

        let sources = space.sources();
        assert_eq!(sources[0].table, "players");
        assert_eq!(sources[1].table, "actor_position");
    }

    #[test]
    fn test_optional_kind_does_not_make_space_incomplete() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE characters (id INTEGER PRIMARY KEY);
                 CREATE TABLE actor_position (id INTEGER PRIMARY KEY);",
            )
            .unwrap();
        let mut config = Config::default();
        config.classifier.required_owner_kinds = vec![OwnerKind::Character, OwnerKind::Structure];

        let (space, omissions) =
            OwnerSpace::load(&store, &config.schema, &config.classifier).unwrap();
        assert_eq!(omissions.len(), 1);
        assert!(space.is_complete());
    }
}
