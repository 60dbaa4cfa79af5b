//! Core configuration loading
//!
//! Loads configuration from `~/.config/slotgrid/config.toml` (or the
//! `SLOTGRID_CONFIG` env var). Every field has a default, so an absent file
//! yields the stock fifteen-row matrix.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::ledger::DEFAULT_SEQUENCE_START;
use crate::matrix::RowSpec;
use crate::registry::{IdentifierRegistry, RuntimeId};

/// Root configuration for the state/execution core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Sequence number of the first entry in every session
    #[serde(default = "default_sequence_start")]
    pub sequence_start: u64,

    /// Pending inputs kept per slot before the oldest is dropped
    #[serde(default = "default_input_buffer_capacity")]
    pub input_buffer_capacity: usize,

    /// Execution records kept per slot
    #[serde(default = "default_output_buffer_capacity")]
    pub output_buffer_capacity: usize,

    /// Timeout for loads and executions without an explicit timeout
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Upper bound on executions per slot per tick
    #[serde(default = "default_max_executions_per_tick")]
    pub max_executions_per_tick: usize,

    /// Whether rows pick up new unit versions from the log on their own
    #[serde(default = "default_true")]
    pub follow_log: bool,

    /// Whether executions are appended to the log as `unit_executed`
    #[serde(default = "default_true")]
    pub record_executions: bool,

    /// Capacity of the slot event broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Matrix rows in declaration order
    #[serde(default = "default_rows")]
    pub rows: Vec<RowConfig>,
}

/// One engine row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowConfig {
    /// Row letter(s), used in grid addresses (`a1`)
    pub id: String,

    /// Runtime name or alias resolved through the identifier registry
    pub runtime: String,

    #[serde(default = "default_max_slots")]
    pub max_slots: usize,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl RowConfig {
    pub fn new(id: impl Into<String>, runtime: impl Into<String>, max_slots: usize) -> Self {
        Self {
            id: id.into(),
            runtime: runtime.into(),
            max_slots,
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_sequence_start() -> u64 {
    DEFAULT_SEQUENCE_START
}

fn default_input_buffer_capacity() -> usize {
    100
}

fn default_output_buffer_capacity() -> usize {
    50
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_executions_per_tick() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_max_slots() -> usize {
    16
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_rows() -> Vec<RowConfig> {
    let mut rows = vec![RowConfig::new("a", "python", 64)];
    let rest = [
        ("b", "javascript"),
        ("c", "typescript"),
        ("d", "rust"),
        ("e", "java"),
        ("f", "swift"),
        ("g", "cpp"),
        ("h", "r"),
        ("i", "go"),
        ("j", "ruby"),
        ("k", "csharp"),
        ("l", "kotlin"),
        ("m", "c"),
        ("n", "bash"),
        ("o", "perl"),
    ];
    rows.extend(
        rest.iter()
            .map(|(id, runtime)| RowConfig::new(*id, *runtime, default_max_slots())),
    );
    rows
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sequence_start: default_sequence_start(),
            input_buffer_capacity: default_input_buffer_capacity(),
            output_buffer_capacity: default_output_buffer_capacity(),
            default_timeout_ms: default_timeout_ms(),
            max_executions_per_tick: default_max_executions_per_tick(),
            follow_log: true,
            record_executions: true,
            event_channel_capacity: default_event_channel_capacity(),
            rows: default_rows(),
        }
    }
}

impl CoreConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "SLOTGRID_CONFIG";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "config.toml";

    /// Load configuration from file
    ///
    /// Resolution order:
    /// 1. `SLOTGRID_CONFIG` environment variable
    /// 2. `<config dir>/slotgrid/config.toml`
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "slotgrid config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoreError::config_with_source(format!("failed to read config at {}", path.display()), e)
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: CoreConfig = toml::from_str(contents)
            .map_err(|e| CoreError::config_with_source("failed to parse config", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .map(|d| d.join("slotgrid").join(Self::DEFAULT_CONFIG_FILENAME))
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sequence_start == 0 {
            return Err(CoreError::config("sequence_start must be at least 1"));
        }
        if self.default_timeout_ms == 0 {
            return Err(CoreError::config("default_timeout_ms must be positive"));
        }
        if self.max_executions_per_tick == 0 {
            return Err(CoreError::config("max_executions_per_tick must be positive"));
        }
        if self.event_channel_capacity == 0 {
            return Err(CoreError::config("event_channel_capacity must be positive"));
        }
        if self.rows.is_empty() {
            return Err(CoreError::config("at least one row is required"));
        }
        let mut seen = std::collections::HashSet::new();
        for row in &self.rows {
            if !seen.insert(row.id.as_str()) {
                return Err(CoreError::config(format!("duplicate row id {}", row.id)));
            }
            if row.max_slots == 0 {
                return Err(CoreError::config(format!("row {} has max_slots = 0", row.id)));
            }
            if row.tick_interval_ms == 0 {
                return Err(CoreError::config(format!(
                    "row {} has tick_interval_ms = 0",
                    row.id
                )));
            }
        }
        if self.output_buffer_capacity == 0 {
            tracing::warn!("output_buffer_capacity is 0; execution results will not be kept");
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Resolve row runtimes against the registry.
    pub fn row_specs(&self, registry: &IdentifierRegistry) -> Result<Vec<RowSpec>> {
        self.rows
            .iter()
            .map(|row| {
                let runtime_id = registry.resolve(&row.runtime);
                if runtime_id == RuntimeId::UNKNOWN {
                    return Err(CoreError::config(format!(
                        "row {} names unknown runtime {}",
                        row.id, row.runtime
                    )));
                }
                Ok(RowSpec {
                    id: row.id.clone(),
                    runtime_id,
                    max_slots: row.max_slots,
                    tick_interval: Duration::from_millis(row.tick_interval_ms),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_describe_stock_matrix() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.rows.len(), 15);
        assert_eq!(cfg.rows[0].max_slots, 64);
        assert_eq!(cfg.rows.iter().map(|r| r.max_slots).sum::<usize>(), 64 + 14 * 16);

        let specs = cfg
            .row_specs(&IdentifierRegistry::builtin())
            .expect("specs");
        assert_eq!(specs[3].runtime_id, RuntimeId::RUST);
        assert_eq!(specs[3].tick_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_parse_partial_file() {
        let cfg = CoreConfig::parse(
            r#"
            default_timeout_ms = 500
            follow_log = false

            [[rows]]
            id = "x"
            runtime = "c++"
            max_slots = 4
            "#,
        )
        .expect("parse");

        assert_eq!(cfg.default_timeout(), Duration::from_millis(500));
        assert!(!cfg.follow_log);
        assert_eq!(cfg.input_buffer_capacity, 100);
        assert_eq!(cfg.rows, vec![RowConfig::new("x", "c++", 4)]);
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        let err = match CoreConfig::parse("sequence_start = 0") {
            Ok(_) => panic!("zero start must be rejected"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::ConfigError);

        assert!(CoreConfig::parse("rows = []").is_err());
        assert!(CoreConfig::parse("default_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_unknown_runtime_is_config_error() {
        let cfg = CoreConfig {
            rows: vec![RowConfig::new("a", "cobol", 2)],
            ..CoreConfig::default()
        };
        let err = match cfg.row_specs(&IdentifierRegistry::builtin()) {
            Ok(_) => panic!("unknown runtime"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_executions_per_tick = 2\n").expect("write");

        let cfg = CoreConfig::load_from_path(&path).expect("load");
        assert_eq!(cfg.max_executions_per_tick, 2);
        assert!(CoreConfig::load_from_path(&dir.path().join("missing.toml")).is_err());
    }
}
