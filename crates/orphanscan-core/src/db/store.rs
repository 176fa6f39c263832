//! Store handle

use super::catalog::SchemaCatalog;
use crate::error::{OrphanScanError, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use tracing::info;

/// One connection to a game store plus the catalog read when it was opened.
///
/// Read paths borrow it shared; cleanup execution borrows it mutably, which
/// keeps the writer exclusive for the whole execution.
pub struct Store {
    pub(crate) conn: Connection,
    catalog: SchemaCatalog,
    path: Option<PathBuf>,
    read_only: bool,
}

impl Store {
    /// Open an existing store for reading and writing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), false)
    }

    /// Open an existing store read-only (planning, reports)
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), true)
    }

    fn open_with(path: &Path, read_only: bool) -> Result<Self> {
        if !path.exists() {
            return Err(OrphanScanError::StoreUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let conn = Connection::open_with_flags(path, flags).map_err(OrphanScanError::from_store)?;

        // No busy timeout: lock contention surfaces immediately as StoreLocked.
        let catalog = SchemaCatalog::introspect(&conn).map_err(|e| match e {
            OrphanScanError::Database(err) => OrphanScanError::from_store(err),
            other => other,
        })?;
        info!(
            path = %path.display(),
            read_only,
            tables = catalog.tables().count(),
            "opened store"
        );

        Ok(Self {
            conn,
            catalog,
            path: Some(path.to_path_buf()),
            read_only,
        })
    }

    /// Open in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, introspecting its schema
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let catalog = SchemaCatalog::introspect(&conn)?;
        Ok(Self {
            conn,
            catalog,
            path: None,
            read_only: false,
        })
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Re-read the catalog after the schema changed underneath us
    pub fn refresh_catalog(&mut self) -> Result<()> {
        self.catalog = SchemaCatalog::introspect(&self.conn)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Run setup SQL against the store (fixtures, migrations run by callers)
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        self.refresh_catalog()
    }

    /// Reclaim free pages after a large deletion
    pub fn vacuum(&mut self) -> Result<()> {
        self.conn.execute("VACUUM", []).map_err(OrphanScanError::from_store)?;
        Ok(())
    }

    /// Number of rows in a table, `None` when the table is absent
    pub fn row_count(&self, table: &str) -> Result<Option<u64>> {
        if !self.catalog.table_exists(table) {
            return Ok(None);
        }
        let table = crate::config::identifier::validate(table)?;
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {}",
                crate::config::identifier::quote(table)
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(Some(count as u64))
    }
}
