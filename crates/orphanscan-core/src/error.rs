//! Error types for orphanscan

use thiserror::Error;

/// Result type alias using OrphanScanError
pub type Result<T> = std::result::Result<T, OrphanScanError>;

/// Error type alias for convenience
pub type Error = OrphanScanError;

/// Exit codes for CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const NOT_FOUND: i32 = 2;
    pub const INVALID_INPUT: i32 = 3;
    pub const GATE_REFUSED: i32 = 4;
    pub const EXECUTION_FAILED: i32 = 5;
    pub const STORE_BUSY: i32 = 6;
}

/// Main error type for orphanscan
#[derive(Debug, Error)]
pub enum OrphanScanError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema unsupported: {table}{}", column.as_deref().map(|c| format!(".{}", c)).unwrap_or_default())]
    SchemaUnsupported {
        table: String,
        column: Option<String>,
    },

    #[error("Owner id {owner_id} found in several owner spaces: {kinds}")]
    ClassificationConflict { owner_id: i64, kinds: String },

    #[error("No backup found; destructive execution refused")]
    BackupMissing,

    #[error("Backup is stale ({age_secs}s old, maximum {max_age_secs}s)")]
    BackupStale { age_secs: u64, max_age_secs: u64 },

    #[error("Backup checksum could not be verified")]
    BackupChecksumInvalid,

    #[error("Confirmation token rejected")]
    ConfirmationRejected,

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session is in terminal state {0}; create a new session to retry")]
    SessionTerminal(String),

    #[error("Action #{index} on {table} failed: {reason}")]
    ActionExecutionFailed {
        index: usize,
        table: String,
        reason: String,
    },

    #[error("Audit log write failed: {0}")]
    AuditWriteFailed(String),

    #[error("Store is locked by another process")]
    StoreLocked,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl OrphanScanError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SchemaUnsupported { .. } => exit_codes::NOT_FOUND,
            Self::Config(_) | Self::InvalidInput(_) => exit_codes::INVALID_INPUT,
            Self::BackupMissing
            | Self::BackupStale { .. }
            | Self::BackupChecksumInvalid
            | Self::ConfirmationRejected
            | Self::InvalidTransition { .. }
            | Self::SessionTerminal(_) => exit_codes::GATE_REFUSED,
            Self::ActionExecutionFailed { .. } | Self::AuditWriteFailed(_) => {
                exit_codes::EXECUTION_FAILED
            }
            Self::StoreLocked => exit_codes::STORE_BUSY,
            _ => exit_codes::GENERAL_ERROR,
        }
    }

    /// Whether this error refuses the destructive path of a session
    pub fn is_gate_refusal(&self) -> bool {
        self.exit_code() == exit_codes::GATE_REFUSED
    }

    /// Map a raw SQLite error onto the store taxonomy.
    ///
    /// Busy and locked codes surface as `StoreLocked`, open failures as
    /// `StoreUnavailable`; everything else stays a `Database` error.
    pub fn from_store(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => Self::StoreLocked,
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => {
                Self::StoreUnavailable(err.to_string())
            }
            _ => Self::Database(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_refusals_share_exit_code() {
        assert!(OrphanScanError::BackupMissing.is_gate_refusal());
        assert!(OrphanScanError::ConfirmationRejected.is_gate_refusal());
        assert!(!OrphanScanError::StoreLocked.is_gate_refusal());
        assert_eq!(
            OrphanScanError::ActionExecutionFailed {
                index: 0,
                table: "item_inventory".into(),
                reason: "boom".into()
            }
            .exit_code(),
            exit_codes::EXECUTION_FAILED
        );
    }

    #[test]
    fn test_schema_unsupported_display() {
        let err = OrphanScanError::SchemaUnsupported {
            table: "guilds".into(),
            column: Some("guildId".into()),
        };
        assert_eq!(err.to_string(), "Schema unsupported: guilds.guildId");

        let err = OrphanScanError::SchemaUnsupported {
            table: "guilds".into(),
            column: None,
        };
        assert_eq!(err.to_string(), "Schema unsupported: guilds");
    }
}
