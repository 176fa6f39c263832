//! Database layer for orphanscan
//!
//! Provides read access to a game-state SQLite store:
//! - Schema catalog introspected at open time
//! - Owner registry and owned-row snapshots
//! - Event log statistics

mod catalog;
mod events;
mod records;
mod store;

pub use catalog::{ColumnInfo, Omission, SchemaCatalog, TableInfo};
pub use events::{EventStats, RetentionPreview, RETENTION_PRESETS};
pub use store::Store;
