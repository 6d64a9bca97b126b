use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::VigilError;

pub const DEFAULT_LOOP_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_CONCURRENT_TICKS: usize = 8;
pub const DEFAULT_MAX_DURATION_SECS: u64 = 60;
pub const DEFAULT_MIN_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HOUSEKEEPING_INTERVAL_SECS: u64 = 3_600;
pub const DEFAULT_LEASE_TTL_SECS: u64 = 30;
pub const DEFAULT_LOCATION: &str = "default";

/// Top-level config (vigil.toml + VIGIL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub ticks: TickHistoryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Filesystem sensors declared directly in config.
    #[serde(default)]
    pub sensors: Vec<DirectorySensorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Daemon loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Cadence of the scheduling loop. Sensor intervals are enforced on top of it.
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
    /// Upper bound on evaluations running at the same time across all sensors.
    #[serde(default = "default_max_concurrent_ticks")]
    pub max_concurrent_ticks: usize,
    /// Evaluation deadline for sensors that do not declare their own.
    #[serde(default = "default_max_duration_secs")]
    pub default_max_duration_secs: u64,
    /// How often tick history and the run-key index are purged.
    #[serde(default = "default_housekeeping_interval_secs")]
    pub housekeeping_interval_secs: u64,
    /// Lifetime of the single-daemon lease; renewed at a third of this.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: DEFAULT_LOOP_INTERVAL_MS,
            max_concurrent_ticks: DEFAULT_MAX_CONCURRENT_TICKS,
            default_max_duration_secs: DEFAULT_MAX_DURATION_SECS,
            housekeeping_interval_secs: DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
        }
    }
}

/// Run-key deduplication lookback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Keys older than this many days are forgotten and may dispatch again.
    /// Unset keeps every key forever.
    #[serde(default)]
    pub retention_days: Option<u64>,
}

/// Tick history retention.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickHistoryConfig {
    /// Unset keeps every tick record forever.
    #[serde(default)]
    pub retention_days: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Directory the spool dispatcher writes accepted run requests into.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
        }
    }
}

/// A sensor that requests a run for every new file in a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySensorConfig {
    pub name: String,
    #[serde(default = "default_location")]
    pub location: String,
    pub directory: String,
    /// Job the requested runs target.
    pub job: String,
    #[serde(default = "default_min_interval_secs")]
    pub interval_secs: u64,
    /// Falls back to `daemon.default_max_duration_secs`.
    pub max_duration_secs: Option<u64>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn bool_true() -> bool {
    true
}
fn default_loop_interval_ms() -> u64 {
    DEFAULT_LOOP_INTERVAL_MS
}
fn default_max_concurrent_ticks() -> usize {
    DEFAULT_MAX_CONCURRENT_TICKS
}
fn default_max_duration_secs() -> u64 {
    DEFAULT_MAX_DURATION_SECS
}
fn default_housekeeping_interval_secs() -> u64 {
    DEFAULT_HOUSEKEEPING_INTERVAL_SECS
}
fn default_lease_ttl_secs() -> u64 {
    DEFAULT_LEASE_TTL_SECS
}
fn default_min_interval_secs() -> u64 {
    DEFAULT_MIN_INTERVAL_SECS
}
fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}
fn default_db_path() -> String {
    format!("{}/vigil.db", vigil_home())
}
fn default_spool_dir() -> String {
    format!("{}/spool", vigil_home())
}

fn vigil_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.vigil", home)
}

impl VigilConfig {
    /// Load config from a TOML file with VIGIL_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `VIGIL_DAEMON__MAX_CONCURRENT_TICKS=4`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: VigilConfig = Self::figment(&path)
            .extract()
            .map_err(|e| VigilError::Config(e.to_string()))?;

        config.validate()?;
        debug!(path = %path, sensors = config.sensors.len(), "configuration loaded");
        Ok(config)
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VIGIL_").split("__"))
    }

    fn validate(&self) -> crate::error::Result<()> {
        let daemon = &self.daemon;
        let positive = [
            ("daemon.max_concurrent_ticks", daemon.max_concurrent_ticks as u64),
            ("daemon.loop_interval_ms", daemon.loop_interval_ms),
            ("daemon.housekeeping_interval_secs", daemon.housekeeping_interval_secs),
            ("daemon.default_max_duration_secs", daemon.default_max_duration_secs),
            ("daemon.lease_ttl_secs", daemon.lease_ttl_secs),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(VigilError::Invalid {
                field: *field,
                reason: "must be positive".to_string(),
            });
        }
        if let Some(sensor) = self.sensors.iter().find(|s| s.interval_secs == 0) {
            return Err(VigilError::Invalid {
                field: "sensors.interval_secs",
                reason: format!("sensor '{}' must poll at a positive interval", sensor.name),
            });
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    format!("{}/vigil.toml", vigil_home())
}
