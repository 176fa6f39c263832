//! Configuration management

pub mod identifier;

use crate::cleanup::RiskTier;
use crate::error::Result;
use crate::ownership::OwnerKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Where owners, owned rows and events live
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Ownership classifier tuning
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Damage detector thresholds
    #[serde(default)]
    pub damage: DamagePolicy,

    /// Execution gate policy
    #[serde(default)]
    pub gate: GateConfig,
}

/// Table layout of the game store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Candidate character tables; the first one present is used
    #[serde(default = "default_character_tables")]
    pub character_tables: Vec<String>,

    #[serde(default = "default_id_column")]
    pub character_id_column: String,

    /// Unix timestamp of the last login, used to decide who is active
    #[serde(default = "default_last_online_column")]
    pub character_last_online_column: String,

    #[serde(default = "default_alive_column")]
    pub character_alive_column: String,

    #[serde(default = "default_guild_column")]
    pub character_guild_column: String,

    /// Placed actors (chests, benches, ...) that own items
    #[serde(default = "default_structure_registry")]
    pub structures: RegistryConfig,

    #[serde(default = "default_guild_registry")]
    pub guilds: RegistryConfig,

    /// Building ownership: which character or guild placed which object
    #[serde(default)]
    pub buildings: BuildingRegistryConfig,

    /// Tables whose rows carry an owner id and may be orphaned
    #[serde(default = "default_owned_tables")]
    pub owned_tables: Vec<OwnedTableConfig>,

    #[serde(default)]
    pub events: EventTableConfig,

    /// `table.column` pairs searched for traces of orphaned owners
    #[serde(default = "default_trace_columns")]
    pub trace_columns: Vec<TraceColumn>,
}

/// A table listing the ids of one owner kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub table: String,
    pub id_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildingRegistryConfig {
    #[serde(default = "default_buildings_table")]
    pub table: String,
    #[serde(default = "default_object_column")]
    pub object_column: String,
    #[serde(default = "default_owner_column")]
    pub owner_column: String,
}

impl Default for BuildingRegistryConfig {
    fn default() -> Self {
        Self {
            table: default_buildings_table(),
            object_column: default_object_column(),
            owner_column: default_owner_column(),
        }
    }
}

/// A table whose rows belong to some owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedTableConfig {
    pub table: String,
    #[serde(default = "default_owner_column")]
    pub owner_column: String,
    /// Row identity column (falls back to `rowid` when absent)
    #[serde(default)]
    pub id_column: Option<String>,
    /// Column whose length approximates the row's storage cost
    #[serde(default)]
    pub payload_column: Option<String>,
    #[serde(default = "default_owned_risk")]
    pub risk: RiskTier,
}

/// Event log layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTableConfig {
    #[serde(default = "default_events_table")]
    pub table: String,
    #[serde(default = "default_time_column")]
    pub time_column: String,
    #[serde(default = "default_type_column")]
    pub type_column: String,
    #[serde(default)]
    pub time_format: TimeFormat,
}

impl Default for EventTableConfig {
    fn default() -> Self {
        Self {
            table: default_events_table(),
            time_column: default_time_column(),
            type_column: default_type_column(),
            time_format: TimeFormat::default(),
        }
    }
}

/// How event timestamps are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    /// Decide from the column name and the stored value type
    #[default]
    Auto,
    /// Seconds since the Unix epoch
    Unix,
    /// RFC 3339 / ISO 8601 text
    Iso,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceColumn {
    pub table: String,
    pub column: String,
}

/// Inclusive range of ids reused by transient server-side actors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: i64,
    pub end: i64,
}

impl IdRange {
    pub fn contains(&self, id: i64) -> bool {
        self.start <= id && id <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_transient_ranges")]
    pub transient_ranges: Vec<IdRange>,

    /// Worker threads for classification (0 = available parallelism)
    #[serde(default)]
    pub workers: usize,

    /// Owner kinds whose registry must load before anything is called
    /// orphaned
    #[serde(default = "default_required_owner_kinds")]
    pub required_owner_kinds: Vec<OwnerKind>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            transient_ranges: default_transient_ranges(),
            workers: 0,
            required_owner_kinds: default_required_owner_kinds(),
        }
    }
}

/// Severity thresholds for the damage detector.
///
/// Ratios are compared strictly: a ratio equal to `critical_ratio` is not
/// critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamagePolicy {
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,

    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: f64,

    /// Below this many active owners the detector reports Normal
    #[serde(default = "default_min_active_owners")]
    pub min_active_owners: usize,

    /// Characters seen within this many days count as active
    #[serde(default = "default_active_within_days")]
    pub active_within_days: i64,

    /// Average structure-owned records per active owner from an earlier run
    #[serde(default)]
    pub baseline_average: Option<f64>,
}

impl Default for DamagePolicy {
    fn default() -> Self {
        Self {
            warning_ratio: default_warning_ratio(),
            critical_ratio: default_critical_ratio(),
            min_active_owners: default_min_active_owners(),
            active_within_days: default_active_within_days(),
            baseline_average: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_max_backup_age")]
    pub max_backup_age_secs: u64,

    /// Refuse backups whose checksum sidecar is missing or wrong
    #[serde(default = "default_true")]
    pub require_checksum: bool,

    #[serde(default)]
    pub audit_dir: Option<PathBuf>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_backup_age_secs: default_max_backup_age(),
            require_checksum: true,
            audit_dir: None,
        }
    }
}

impl GateConfig {
    /// Directory receiving one audit file per session
    pub fn audit_dir(&self) -> PathBuf {
        self.audit_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(crate::DATA_DIR_NAME)
                .join("audit")
        })
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            character_tables: default_character_tables(),
            character_id_column: default_id_column(),
            character_last_online_column: default_last_online_column(),
            character_alive_column: default_alive_column(),
            character_guild_column: default_guild_column(),
            structures: default_structure_registry(),
            guilds: default_guild_registry(),
            buildings: BuildingRegistryConfig::default(),
            owned_tables: default_owned_tables(),
            events: EventTableConfig::default(),
            trace_columns: default_trace_columns(),
        }
    }
}

fn default_character_tables() -> Vec<String> {
    vec![
        "characters".to_string(),
        "character".to_string(),
        "players".to_string(),
    ]
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_last_online_column() -> String {
    "lastTimeOnline".to_string()
}

fn default_alive_column() -> String {
    "isAlive".to_string()
}

fn default_guild_column() -> String {
    "guild".to_string()
}

fn default_structure_registry() -> RegistryConfig {
    RegistryConfig {
        table: "actor_position".to_string(),
        id_column: "id".to_string(),
    }
}

fn default_guild_registry() -> RegistryConfig {
    RegistryConfig {
        table: "guilds".to_string(),
        id_column: "guildId".to_string(),
    }
}

fn default_buildings_table() -> String {
    "buildings".to_string()
}

fn default_object_column() -> String {
    "object_id".to_string()
}

fn default_owner_column() -> String {
    "owner_id".to_string()
}

fn default_owned_risk() -> RiskTier {
    RiskTier::Inventory
}

fn default_owned_tables() -> Vec<OwnedTableConfig> {
    vec![OwnedTableConfig {
        table: "item_inventory".to_string(),
        owner_column: default_owner_column(),
        id_column: Some("item_id".to_string()),
        payload_column: Some("data".to_string()),
        risk: RiskTier::Inventory,
    }]
}

fn default_events_table() -> String {
    "game_events".to_string()
}

fn default_time_column() -> String {
    "worldTime".to_string()
}

fn default_type_column() -> String {
    "eventType".to_string()
}

fn default_trace_columns() -> Vec<TraceColumn> {
    [
        ("game_events", "player_id"),
        ("game_events", "target_id"),
        ("buildings", "owner_id"),
        ("buildable_health", "owner_id"),
        ("properties", "object_id"),
    ]
    .iter()
    .map(|(table, column)| TraceColumn {
        table: table.to_string(),
        column: column.to_string(),
    })
    .collect()
}

fn default_transient_ranges() -> Vec<IdRange> {
    vec![IdRange {
        start: i64::MIN,
        end: -1,
    }]
}

fn default_required_owner_kinds() -> Vec<OwnerKind> {
    OwnerKind::PRIORITY.to_vec()
}

fn default_warning_ratio() -> f64 {
    0.05
}

fn default_critical_ratio() -> f64 {
    0.10
}

fn default_min_active_owners() -> usize {
    1
}

fn default_active_within_days() -> i64 {
    30
}

fn default_max_backup_age() -> u64 {
    24 * 60 * 60
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load config from `ORPHANSCAN_CONFIG` or the default path
    pub fn load() -> Result<Self> {
        let path = std::env::var("ORPHANSCAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        Self::load_from(&path)
    }

    /// Load config from an explicit path, using defaults when it is absent
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<Config>(&content)?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save config to default path
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::CONFIG_DIR_NAME)
            .join("config.yml")
    }

    /// Reject identifiers and thresholds that cannot be used safely
    pub fn validate(&self) -> Result<()> {
        let schema = &self.schema;
        for name in &schema.character_tables {
            identifier::validate(name)?;
        }
        for name in [
            &schema.character_id_column,
            &schema.character_last_online_column,
            &schema.character_alive_column,
            &schema.character_guild_column,
            &schema.structures.table,
            &schema.structures.id_column,
            &schema.guilds.table,
            &schema.guilds.id_column,
            &schema.buildings.table,
            &schema.buildings.object_column,
            &schema.buildings.owner_column,
            &schema.events.table,
            &schema.events.time_column,
            &schema.events.type_column,
        ] {
            identifier::validate(name)?;
        }
        for owned in &schema.owned_tables {
            identifier::validate(&owned.table)?;
            identifier::validate(&owned.owner_column)?;
            if let Some(ref id) = owned.id_column {
                identifier::validate(id)?;
            }
            if let Some(ref payload) = owned.payload_column {
                identifier::validate(payload)?;
            }
        }
        for trace in &schema.trace_columns {
            identifier::validate(&trace.table)?;
            identifier::validate(&trace.column)?;
        }

        for range in &self.classifier.transient_ranges {
            if range.start > range.end {
                return Err(crate::Error::Config(format!(
                    "transient range {}..={} is empty",
                    range.start, range.end
                )));
            }
        }

        let damage = &self.damage;
        if !(0.0..=1.0).contains(&damage.warning_ratio)
            || !(0.0..=1.0).contains(&damage.critical_ratio)
            || damage.warning_ratio > damage.critical_ratio
        {
            return Err(crate::Error::Config(
                "damage ratios must satisfy 0 <= warning <= critical <= 1".to_string(),
            ));
        }
        Ok(())
    }
}
