//! Schema catalog
//!
//! Introspected once when a store is opened. Lookups never fail: an unknown
//! table or column simply reports `false`, and callers degrade the affected
//! analysis instead of aborting.

use crate::error::{OrphanScanError, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// Tables and columns present in the store, keyed case-insensitively
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableInfo>,
}

impl SchemaCatalog {
    /// Read table and column definitions from `sqlite_master`
    pub fn introspect(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut col_stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
        let mut tables = BTreeMap::new();
        for name in names {
            let columns = col_stmt
                .query_map([&name], |row| {
                    Ok(ColumnInfo {
                        name: row.get(0)?,
                        decl_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            tables.insert(name.to_lowercase(), TableInfo { name, columns });
        }

        debug!(tables = tables.len(), "schema catalog introspected");
        Ok(Self { tables })
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.tables.contains_key(&table.to_lowercase())
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)))
            .unwrap_or(false)
    }

    pub fn table(&self, table: &str) -> Option<&TableInfo> {
        self.tables.get(&table.to_lowercase())
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    /// First candidate table that exists
    pub fn first_existing<'a>(&self, candidates: &'a [String]) -> Option<&'a str> {
        candidates
            .iter()
            .map(String::as_str)
            .find(|t| self.table_exists(t))
    }

    /// `SchemaUnsupported` unless the table (and every listed column) exists
    pub fn require(&self, table: &str, columns: &[&str]) -> Result<()> {
        if !self.table_exists(table) {
            return Err(OrphanScanError::SchemaUnsupported {
                table: table.to_string(),
                column: None,
            });
        }
        for column in columns {
            if !self.has_column(table, column) {
                return Err(OrphanScanError::SchemaUnsupported {
                    table: table.to_string(),
                    column: Some(column.to_string()),
                });
            }
        }
        Ok(())
    }
}

/// Part of an analysis or plan that was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Omission {
    pub scope: String,
    pub reason: String,
}

impl Omission {
    pub fn new(scope: impl Into<String>, err: &OrphanScanError) -> Self {
        Self {
            scope: scope.into(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE characters (id INTEGER PRIMARY KEY, char_name TEXT, isAlive INTEGER);
             CREATE TABLE item_inventory (item_id INTEGER, owner_id INTEGER, data BLOB);",
        )
        .unwrap();
        SchemaCatalog::introspect(&conn).unwrap()
    }

    #[test]
    fn test_lookups_are_case_insensitive() {
        let catalog = catalog();
        assert!(catalog.table_exists("characters"));
        assert!(catalog.table_exists("Characters"));
        assert!(catalog.has_column("characters", "isalive"));
        assert!(catalog.has_column("ITEM_INVENTORY", "owner_id"));
    }

    #[test]
    fn test_unknown_names_are_false_not_errors() {
        let catalog = catalog();
        assert!(!catalog.table_exists("guilds"));
        assert!(!catalog.has_column("guilds", "guildId"));
        assert!(!catalog.has_column("characters", "lastTimeOnline"));
    }

    #[test]
    fn test_first_existing_and_require() {
        let catalog = catalog();
        let candidates = vec!["players".to_string(), "characters".to_string()];
        assert_eq!(catalog.first_existing(&candidates), Some("characters"));

        assert!(catalog.require("item_inventory", &["owner_id", "data"]).is_ok());
        match catalog.require("item_inventory", &["template_id"]) {
            Err(OrphanScanError::SchemaUnsupported { table, column }) => {
                assert_eq!(table, "item_inventory");
                assert_eq!(column.as_deref(), Some("template_id"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
