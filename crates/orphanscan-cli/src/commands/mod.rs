//! CLI command implementations

pub mod analyze;
pub mod cleanup;
pub mod events;
pub mod plan;
pub mod schema;
