//! SQL identifier validation
//!
//! Table and column names come from configuration and are interpolated into
//! statements, so they are checked against a conservative pattern and always
//! emitted double-quoted.

use crate::error::{OrphanScanError, Result};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Check that `name` is a plain SQL identifier
pub fn validate(name: &str) -> Result<&str> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(OrphanScanError::Config(format!(
            "invalid SQL identifier: {:?}",
            name
        )))
    }
}

/// Quote an already validated identifier for use in SQL text
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}
