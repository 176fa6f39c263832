//! Snapshots of owner registries and owned rows

use super::Store;
use crate::config::identifier::{quote, validate};
use crate::config::{DamagePolicy, OwnedTableConfig, RegistryConfig, SchemaConfig};
use crate::damage::ActiveOwner;
use crate::error::{OrphanScanError, Result};
use crate::ownership::Record;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Row};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Interpret a stored id; game stores occasionally keep ids as text
pub(crate) fn value_as_id(value: ValueRef<'_>) -> Option<i64> {
    match value {
        ValueRef::Integer(i) => Some(i),
        ValueRef::Real(f) if f.fract() == 0.0 => Some(f as i64),
        ValueRef::Text(t) => std::str::from_utf8(t).ok()?.trim().parse().ok(),
        _ => None,
    }
}

fn id_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<i64>> {
    Ok(value_as_id(row.get_ref(idx)?))
}

impl Store {
    /// Distinct non-null ids of a registry table
    pub fn id_set(&self, registry: &RegistryConfig) -> Result<HashSet<i64>> {
        self.catalog()
            .require(&registry.table, &[registry.id_column.as_str()])?;
        let sql = format!(
            "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL",
            col = quote(validate(&registry.id_column)?),
            table = quote(validate(&registry.table)?),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| id_at(row, 0))?
            .filter_map(|r| r.transpose())
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        debug!(table = %registry.table, ids = ids.len(), "loaded owner registry");
        Ok(ids)
    }

    /// Immutable snapshot of every row in an owned table
    pub fn snapshot_records(&self, owned: &OwnedTableConfig) -> Result<Vec<Record>> {
        let catalog = self.catalog();
        catalog.require(&owned.table, &[owned.owner_column.as_str()])?;

        let id_expr = match owned.id_column.as_deref() {
            Some(col) if catalog.has_column(&owned.table, col) => quote(validate(col)?),
            _ => "rowid".to_string(),
        };
        let size_expr = match owned.payload_column.as_deref() {
            Some(col) if catalog.has_column(&owned.table, col) => {
                format!("COALESCE(LENGTH({}), 0)", quote(validate(col)?))
            }
            _ => "0".to_string(),
        };
        let sql = format!(
            "SELECT {id}, {owner}, {size} FROM {table}",
            id = id_expr,
            owner = quote(validate(&owned.owner_column)?),
            size = size_expr,
            table = quote(validate(&owned.table)?),
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], |row| {
                Ok(Record {
                    id: id_at(row, 0)?.unwrap_or_default(),
                    owner_id: id_at(row, 1)?,
                    payload_size: row.get::<_, i64>(2)?.max(0) as u64,
                    table: owned.table.clone(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!(table = %owned.table, records = records.len(), "snapshot taken");
        Ok(records)
    }

    /// Characters considered active, with the structures they can reach.
    ///
    /// Activity uses the last-online column when present, then the alive
    /// flag, then every character. Structures are buildings owned by the
    /// character or by the character's guild.
    pub fn active_owners(
        &self,
        schema: &SchemaConfig,
        policy: &DamagePolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActiveOwner>> {
        let catalog = self.catalog();
        let table = catalog
            .first_existing(&schema.character_tables)
            .ok_or_else(|| OrphanScanError::SchemaUnsupported {
                table: schema.character_tables.join("|"),
                column: None,
            })?;
        let buildings = &schema.buildings;
        catalog.require(
            &buildings.table,
            &[
                buildings.object_column.as_str(),
                buildings.owner_column.as_str(),
            ],
        )?;

        let mut structures_by_owner: HashMap<i64, Vec<i64>> = HashMap::new();
        {
            let sql = format!(
                "SELECT {owner}, {object} FROM {table}",
                owner = quote(validate(&buildings.owner_column)?),
                object = quote(validate(&buildings.object_column)?),
                table = quote(validate(&buildings.table)?),
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| Ok((id_at(row, 0)?, id_at(row, 1)?)))?;
            for row in rows {
                if let (Some(owner), Some(object)) = row? {
                    structures_by_owner.entry(owner).or_default().push(object);
                }
            }
        }

        let guild_expr = if catalog.has_column(table, &schema.character_guild_column) {
            quote(validate(&schema.character_guild_column)?)
        } else {
            "NULL".to_string()
        };
        let mut params: Vec<i64> = Vec::new();
        let filter = if catalog.has_column(table, &schema.character_last_online_column) {
            params.push((now - Duration::days(policy.active_within_days)).timestamp());
            format!(
                "WHERE {} >= ?1",
                quote(validate(&schema.character_last_online_column)?)
            )
        } else if catalog.has_column(table, &schema.character_alive_column) {
            format!(
                "WHERE {} = 1",
                quote(validate(&schema.character_alive_column)?)
            )
        } else {
            String::new()
        };

        let sql = format!(
            "SELECT {id}, {guild} FROM {table} {filter}",
            id = quote(validate(&schema.character_id_column)?),
            guild = guild_expr,
            table = quote(validate(table)?),
            filter = filter,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok((id_at(row, 0)?, id_at(row, 1)?))
        })?;

        let mut owners = Vec::new();
        for row in rows {
            let (Some(character_id), guild_id) = row? else {
                continue;
            };
            let guild_id = guild_id.filter(|g| *g != 0);
            let mut structures = structures_by_owner
                .get(&character_id)
                .cloned()
                .unwrap_or_default();
            if let Some(guild) = guild_id {
                if let Some(shared) = structures_by_owner.get(&guild) {
                    structures.extend_from_slice(shared);
                }
            }
            structures.sort_unstable();
            structures.dedup();
            owners.push(ActiveOwner {
                character_id,
                guild_id,
                structures,
            });
        }
        debug!(active = owners.len(), "loaded active owners");
        Ok(owners)
    }

    /// Rows in `table.column` referencing any of `ids`
    pub fn count_references(&self, table: &str, column: &str, ids: &[i64]) -> Result<u64> {
        self.catalog().require(table, &[column])?;
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} IN ({})",
            quote(validate(table)?),
            quote(validate(column)?),
            placeholders
        );
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(ids.iter()), |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Average stored bytes per row, sampled from the first hundred rows
    pub fn estimate_row_bytes(&self, table: &str) -> Result<f64> {
        let info = self
            .catalog()
            .table(table)
            .ok_or_else(|| OrphanScanError::SchemaUnsupported {
                table: table.to_string(),
                column: None,
            })?;
        if info.columns.is_empty() {
            return Ok(0.0);
        }
        let mut terms = Vec::with_capacity(info.columns.len());
        for column in &info.columns {
            terms.push(format!("COALESCE(LENGTH({}), 0)", quote(validate(&column.name)?)));
        }
        let sql = format!(
            "SELECT AVG({}) FROM (SELECT * FROM {} LIMIT 100)",
            terms.join(" + "),
            quote(validate(table)?)
        );
        let avg: Option<f64> = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(avg.unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::TimeZone;

    fn fixture() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE characters (id INTEGER PRIMARY KEY, char_name TEXT,
                    lastTimeOnline INTEGER, guild INTEGER);
                 CREATE TABLE guilds (guildId INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE buildings (object_id INTEGER, owner_id INTEGER);
                 CREATE TABLE item_inventory (item_id INTEGER, owner_id INTEGER, data BLOB);
                 INSERT INTO characters VALUES (1, 'Conan', 1700000000, 50);
                 INSERT INTO characters VALUES (2, 'Valeria', 1600000000, NULL);
                 INSERT INTO characters VALUES (3, 'Subotai', 1700000000, 0);
                 INSERT INTO guilds VALUES (50, 'Cimmerians');
                 INSERT INTO buildings VALUES (100, 1), (101, 50), (102, 2);
                 INSERT INTO item_inventory VALUES (1, 1, x'0102'), (2, 100, NULL), (3, NULL, x'01');",
            )
            .unwrap();
        store
    }

    #[test]
    fn test_value_as_id() {
        assert_eq!(value_as_id(ValueRef::Integer(7)), Some(7));
        assert_eq!(value_as_id(ValueRef::Text(b" 42 ")), Some(42));
        assert_eq!(value_as_id(ValueRef::Text(b"abc")), None);
        assert_eq!(value_as_id(ValueRef::Null), None);
    }

    #[test]
    fn test_snapshot_records() {
        let store = fixture();
        let config = Config::default();
        let records = store
            .snapshot_records(&config.schema.owned_tables[0])
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].owner_id, Some(1));
        assert_eq!(records[0].payload_size, 2);
        assert_eq!(records[1].payload_size, 0);
        assert_eq!(records[2].owner_id, None);
    }

    #[test]
    fn test_id_set_requires_table() {
        let store = fixture();
        let config = Config::default();
        assert!(matches!(
            store.id_set(&config.schema.structures),
            Err(OrphanScanError::SchemaUnsupported { .. })
        ));
        let guilds = store.id_set(&config.schema.guilds).unwrap();
        assert!(guilds.contains(&50));
    }

    #[test]
    fn test_active_owners_uses_last_online_and_guild_structures() {
        let store = fixture();
        let config = Config::default();
        let now = Utc.timestamp_opt(1_700_000_000 + 3600, 0).unwrap();
        let owners = store
            .active_owners(&config.schema, &config.damage, now)
            .unwrap();

        assert_eq!(owners.len(), 2);
        let conan = owners.iter().find(|o| o.character_id == 1).unwrap();
        assert_eq!(conan.guild_id, Some(50));
        assert_eq!(conan.structures, vec![100, 101]);
        let subotai = owners.iter().find(|o| o.character_id == 3).unwrap();
        assert_eq!(subotai.guild_id, None);
        assert!(subotai.structures.is_empty());
    }

    #[test]
    fn test_count_references() {
        let store = fixture();
        assert_eq!(
            store.count_references("buildings", "owner_id", &[1, 2, 9]).unwrap(),
            2
        );
        assert_eq!(store.count_references("buildings", "owner_id", &[]).unwrap(), 0);
        assert!(store.count_references("properties", "object_id", &[1]).is_err());
    }
}
