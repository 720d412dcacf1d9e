//! Configuration system for the metrics-view engine.
//!
//! Supports TOML-based configuration with global defaults and per-connector overrides.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MetricsViewError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global defaults applied to all connectors unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-connector configuration overrides (keyed by connector name).
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorConfig>,
}

/// Global default settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub query: QueryConfig,
    pub pivot: PivotConfig,
    pub timeseries: TimeseriesConfig,
    pub duckdb: DuckDbConfig,
}

/// Query execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Statement execution timeout in milliseconds (default: 30000, 0 = none).
    pub timeout_ms: u64,
    /// Row limit applied when a request leaves it unset or zero (default: 100).
    pub default_limit: u64,
    /// Hard cap on returned rows (0 = unlimited).
    pub result_cap: u64,
    /// Scheduling priority forwarded to the executor.
    pub priority: i32,
}

/// Pivot limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PivotConfig {
    /// Maximum `rows * (dimensions + measures)` before pivoting is refused.
    pub cell_limit: u64,
    /// Rows per columnar batch when copying into the local engine.
    pub append_batch_rows: usize,
}

/// Time series rendering options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeseriesConfig {
    /// Target chart width in pixels; 0 disables rollup reduction.
    pub pixels: usize,
}

/// DuckDB-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DuckDbConfig {
    /// Maximum concurrently checked-out connections (default: 16).
    pub max_concurrency: usize,
}

/// Per-connector configuration (can override globals).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub query: Option<QueryConfig>,
    pub pivot: Option<PivotConfig>,
    pub duckdb: Option<DuckDbConfig>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            default_limit: 100,
            result_cap: 0,
            priority: 0,
        }
    }
}

impl Default for PivotConfig {
    fn default() -> Self {
        Self {
            cell_limit: 2_000_000,
            append_batch_rows: 1024,
        }
    }
}

impl Default for TimeseriesConfig {
    fn default() -> Self {
        Self { pixels: 0 }
    }
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
        }
    }
}

impl QueryConfig {
    /// Execution timeout as a duration, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MetricsViewError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| MetricsViewError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `METRICSVIEW_CONFIG` environment variable
    /// 2. `./metricsview.toml` (current directory)
    /// 3. `~/.config/metricsview/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("METRICSVIEW_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from METRICSVIEW_CONFIG");
                    return cfg;
                }
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "ignoring unreadable METRICSVIEW_CONFIG");
                }
            }
        }

        if let Ok(cfg) = Self::from_file("metricsview.toml") {
            tracing::info!("loaded config from ./metricsview.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("metricsview").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Get resolved config for a specific connector (merges global defaults).
    pub fn for_connector(&self, name: &str) -> ResolvedConnectorConfig {
        ResolvedConnectorConfig::merge(&self.defaults, self.connectors.get(name))
    }
}

/// Fully resolved configuration for a connector (no Option fields).
#[derive(Debug, Clone)]
pub struct ResolvedConnectorConfig {
    pub query: QueryConfig,
    pub pivot: PivotConfig,
    pub timeseries: TimeseriesConfig,
    pub duckdb: DuckDbConfig,
}

impl Default for ResolvedConnectorConfig {
    fn default() -> Self {
        EngineConfig::default().for_connector("")
    }
}

impl ResolvedConnectorConfig {
    fn merge(defaults: &GlobalDefaults, override_cfg: Option<&ConnectorConfig>) -> Self {
        let ov = override_cfg.cloned().unwrap_or_default();
        Self {
            query: ov.query.unwrap_or_else(|| defaults.query.clone()),
            pivot: ov.pivot.unwrap_or_else(|| defaults.pivot.clone()),
            timeseries: defaults.timeseries.clone(),
            duckdb: ov.duckdb.unwrap_or_else(|| defaults.duckdb.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.defaults.query.timeout_ms, 30_000);
        assert_eq!(cfg.defaults.query.default_limit, 100);
        assert_eq!(cfg.defaults.pivot.cell_limit, 2_000_000);
        assert_eq!(cfg.defaults.duckdb.max_concurrency, 16);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[defaults.query]
timeout_ms = 60000
result_cap = 50000

[defaults.timeseries]
pixels = 800

[connectors.druid.pivot]
cell_limit = 1000
"#;
        let cfg = EngineConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.defaults.query.timeout_ms, 60_000);
        assert_eq!(cfg.defaults.query.result_cap, 50_000);
        assert_eq!(cfg.defaults.query.default_limit, 100);

        let resolved = cfg.for_connector("druid");
        assert_eq!(resolved.pivot.cell_limit, 1000);
        assert_eq!(resolved.timeseries.pixels, 800);
    }

    #[test]
    fn test_connector_override() {
        let toml = r#"
[defaults.duckdb]
max_concurrency = 4

[connectors.prod.duckdb]
max_concurrency = 32
"#;
        let cfg = EngineConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.for_connector("unknown").duckdb.max_concurrency, 4);
        assert_eq!(cfg.for_connector("prod").duckdb.max_concurrency, 32);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let cfg = QueryConfig {
            timeout_ms: 0,
            ..QueryConfig::default()
        };
        assert!(cfg.timeout().is_none());
        assert_eq!(
            QueryConfig::default().timeout(),
            Some(Duration::from_secs(30))
        );
    }
}
