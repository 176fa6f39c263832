//! Orphanscan Core Library
//!
//! Finds records in a game-state SQLite store whose owner no longer exists
//! and removes them without touching data that is merely owned by another
//! kind of entity.
//!
//! # Features
//! - Schema catalog that degrades gracefully across store versions
//! - Ownership classifier over character, structure and guild id spaces
//! - Damage detector for earlier unsafe cleanups
//! - Orphan and event-retention cleanup planning
//! - Execution gate: dry run, backup check, typed confirmation, audit log

pub mod analysis;
pub mod cleanup;
pub mod config;
pub mod damage;
pub mod db;
pub mod error;
pub mod gate;
pub mod ownership;

pub use analysis::{Analysis, AnalysisReport, Analyzer, Baseline, IdPattern, OrphanedOwner};
pub use cleanup::{
    plan_event_cleanup, plan_orphan_cleanup, CleanupAction, CleanupPlan, Cutoff, EventRetention,
    Predicate, RiskTier,
};
pub use config::{Config, DamagePolicy, GateConfig, SchemaConfig};
pub use damage::{detect, ActiveOwner, DamageReport, Severity};
pub use db::{EventStats, Omission, SchemaCatalog, Store};
pub use error::{Error, OrphanScanError, Result};
pub use gate::{
    ActionOutcome, AuditRecord, AuditSink, BackupSignal, CancelHandle, DryRunPreview,
    ExecutionReport, ExecutionSession, JsonlAuditLog, MemoryAuditLog, SessionState,
};
pub use ownership::{
    classify, classify_all, Classification, Confidence, OwnerKind, OwnerSource, OwnerSpace,
    Record, Verdict,
};

/// Default config directory name
pub const CONFIG_DIR_NAME: &str = "orphanscan";

/// Default data directory name (audit logs, damage baselines)
pub const DATA_DIR_NAME: &str = "orphanscan";
