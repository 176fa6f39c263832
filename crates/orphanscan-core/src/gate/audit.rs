//! Append-only audit log for execution sessions

use super::SessionState;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One transition or executed statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub from_state: SessionState,
    pub to_state: SessionState,
    #[serde(default)]
    pub statement: Option<String>,
    #[serde(default)]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Destination for audit records.
///
/// `append` must not return before the record is durable; the session only
/// proceeds once it has.
pub trait AuditSink: Send {
    fn append(&mut self, record: &AuditRecord) -> Result<()>;
}

/// Line-delimited JSON file, flushed and synced per record
pub struct JsonlAuditLog {
    path: PathBuf,
    file: File,
}

impl JsonlAuditLog {
    /// Open (or create) `<dir>/<session_id>.jsonl` for appending
    pub fn create(dir: &Path, session_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", session_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record of an audit file
    pub fn read(path: &Path) -> Result<Vec<AuditRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&mut self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory sink; clones share the same buffer
#[derive(Clone, Default)]
pub struct MemoryAuditLog {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&mut self, record: &AuditRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| crate::Error::Other(anyhow::anyhow!("audit buffer poisoned")))?
            .push(record.clone());
        Ok(())
    }
}
