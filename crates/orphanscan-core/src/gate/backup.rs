//! Backup freshness signal
//!
//! The gate never takes backups. It only consumes an attestation that one
//! exists, how old it is and whether its checksum verified.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSignal {
    pub exists: bool,
    pub age_seconds: u64,
    pub checksum_valid: bool,
}

impl BackupSignal {
    pub fn missing() -> Self {
        Self {
            exists: false,
            age_seconds: 0,
            checksum_valid: false,
        }
    }

    /// Inspect a backup file: age from its mtime, checksum from a
    /// `<file>.sha256` sidecar in `sha256sum` format
    pub fn probe(path: &Path, now: DateTime<Utc>) -> Result<Self> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(Self::missing()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::missing()),
            Err(e) => return Err(e.into()),
        };
        let modified: DateTime<Utc> = metadata.modified()?.into();
        let age_seconds = (now - modified).num_seconds().max(0) as u64;

        let sidecar = sidecar_path(path);
        let checksum_valid = match std::fs::read_to_string(&sidecar) {
            Ok(content) => {
                let expected = content
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_lowercase();
                !expected.is_empty() && sha256_file(path)? == expected
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), age_seconds, checksum_valid, "backup probed");
        Ok(Self {
            exists: true,
            age_seconds,
            checksum_valid,
        })
    }
}

/// `game.db.bak` -> `game.db.bak.sha256`
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let signal = BackupSignal::probe(&dir.path().join("none.db"), Utc::now()).unwrap();
        assert_eq!(signal, BackupSignal::missing());
    }

    #[test]
    fn test_probe_with_valid_sidecar() {
        let dir = tempfile::TempDir::new().unwrap();
        let backup = dir.path().join("game.db.bak");
        std::fs::write(&backup, b"backup bytes").unwrap();
        let digest = sha256_file(&backup).unwrap();
        std::fs::write(sidecar_path(&backup), format!("{}  game.db.bak\n", digest)).unwrap();

        let signal = BackupSignal::probe(&backup, Utc::now()).unwrap();
        assert!(signal.exists);
        assert!(signal.checksum_valid);
        assert!(signal.age_seconds < 60);
    }

    #[test]
    fn test_probe_with_wrong_or_absent_sidecar() {
        let dir = tempfile::TempDir::new().unwrap();
        let backup = dir.path().join("game.db.bak");
        std::fs::write(&backup, b"backup bytes").unwrap();

        let signal = BackupSignal::probe(&backup, Utc::now()).unwrap();
        assert!(signal.exists);
        assert!(!signal.checksum_valid);

        std::fs::write(sidecar_path(&backup), "deadbeef").unwrap();
        let signal = BackupSignal::probe(&backup, Utc::now()).unwrap();
        assert!(!signal.checksum_valid);
    }

    #[test]
    fn test_age_is_measured_from_mtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let backup = dir.path().join("game.db.bak");
        std::fs::write(&backup, b"x").unwrap();
        let later = Utc::now() + chrono::Duration::hours(3);
        let signal = BackupSignal::probe(&backup, later).unwrap();
        assert!(signal.age_seconds >= 3 * 3600 - 60);
    }
}
