//! Output formatters

pub mod terminal;

use anyhow::Result;
use serde::Serialize;

/// Print any core output as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
