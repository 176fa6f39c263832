//! Event log statistics

use super::Store;
use crate::cleanup::Cutoff;
use crate::config::identifier::{quote, validate};
use crate::config::{EventTableConfig, TimeFormat};
use crate::error::Result;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use serde::Serialize;

/// Retention presets shown alongside event statistics
pub const RETENTION_PRESETS: [i64; 3] = [7, 30, 90];

#[derive(Debug, Clone, Serialize)]
pub struct RetentionPreview {
    pub keep_days: i64,
    pub rows_removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub table: String,
    pub total_events: u64,
    pub time_column: String,
    pub time_format: TimeFormat,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub retention: Vec<RetentionPreview>,
}

impl EventStats {
    /// Days between the oldest and newest event
    pub fn history_days(&self) -> Option<i64> {
        Some((self.newest? - self.oldest?).num_days())
    }
}

/// Parse a stored timestamp of either format
pub(crate) fn parse_event_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Integer(secs) => DateTime::from_timestamp(*secs, 0),
        Value::Real(secs) => DateTime::from_timestamp(*secs as i64, 0),
        Value::Text(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
                    .iter()
                    .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                    .map(|naive| naive.and_utc())
            }),
        _ => None,
    }
}

impl Store {
    /// Resolve `Auto` to a concrete timestamp format.
    ///
    /// `worldTime` style columns are Unix seconds; otherwise the type of the
    /// first stored value decides, and an empty table defaults to Unix.
    pub fn resolve_time_format(&self, events: &EventTableConfig) -> Result<TimeFormat> {
        self.catalog()
            .require(&events.table, &[events.time_column.as_str()])?;
        if events.time_format != TimeFormat::Auto {
            return Ok(events.time_format);
        }
        if events.time_column.to_lowercase().contains("worldtime") {
            return Ok(TimeFormat::Unix);
        }
        let sql = format!(
            "SELECT typeof({col}) FROM {table} WHERE {col} IS NOT NULL LIMIT 1",
            col = quote(validate(&events.time_column)?),
            table = quote(validate(&events.table)?),
        );
        let kind: Option<String> = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .optional()?;
        Ok(match kind.as_deref() {
            Some("text") => TimeFormat::Iso,
            _ => TimeFormat::Unix,
        })
    }

    /// Row count, time range and retention previews for the event log
    pub fn event_stats(&self, events: &EventTableConfig, now: DateTime<Utc>) -> Result<EventStats> {
        let format = self.resolve_time_format(events)?;
        let table = quote(validate(&events.table)?);
        let col = quote(validate(&events.time_column)?);

        let total: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        let (min, max): (Value, Value) = self.conn.query_row(
            &format!(
                "SELECT MIN({col}), MAX({col}) FROM {table} WHERE {col} IS NOT NULL",
                col = col,
                table = table
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut retention = Vec::with_capacity(RETENTION_PRESETS.len());
        for days in RETENTION_PRESETS {
            let cutoff = Cutoff::for_format(format, now - Duration::days(days));
            let (clause, value) = cutoff.clause(&events.time_column)?;
            let removed: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE {}", table, clause),
                [value],
                |row| row.get(0),
            )?;
            retention.push(RetentionPreview {
                keep_days: days,
                rows_removed: removed as u64,
            });
        }

        Ok(EventStats {
            table: events.table.clone(),
            total_events: total as u64,
            time_column: events.time_column.clone(),
            time_format: format,
            oldest: parse_event_time(&min),
            newest: parse_event_time(&max),
            retention,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_event_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            parse_event_time(&Value::Integer(expected.timestamp())),
            Some(expected)
        );
        assert_eq!(
            parse_event_time(&Value::Text("2024-03-01T12:00:00Z".into())),
            Some(expected)
        );
        assert_eq!(
            parse_event_time(&Value::Text("2024-03-01 12:00:00".into())),
            Some(expected)
        );
        assert_eq!(parse_event_time(&Value::Null), None);
    }

    #[test]
    fn test_resolve_time_format_auto() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE game_events (worldTime INTEGER, eventType INTEGER);
                 CREATE TABLE audit_events (created TEXT, eventType INTEGER);
                 INSERT INTO audit_events VALUES ('2024-01-01 00:00:00', 1);",
            )
            .unwrap();

        let mut events = EventTableConfig::default();
        assert_eq!(store.resolve_time_format(&events).unwrap(), TimeFormat::Unix);

        events.table = "audit_events".into();
        events.time_column = "created".into();
        assert_eq!(store.resolve_time_format(&events).unwrap(), TimeFormat::Iso);

        events.time_column = "missing".into();
        assert!(store.resolve_time_format(&events).is_err());
    }

    #[test]
    fn test_event_stats_retention_previews() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .execute_batch("CREATE TABLE game_events (worldTime INTEGER, eventType INTEGER);")
            .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        for age_days in [1, 10, 40, 100] {
            let ts = (now - Duration::days(age_days)).timestamp();
            store
                .conn
                .execute("INSERT INTO game_events VALUES (?1, 1)", [ts])
                .unwrap();
        }

        let stats = store.event_stats(&EventTableConfig::default(), now).unwrap();
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.history_days(), Some(99));
        let removed: Vec<u64> = stats.retention.iter().map(|r| r.rows_removed).collect();
        assert_eq!(removed, vec![3, 2, 1]);
    }
}
