//! Engine adapters implementing the execution boundary.
//!
//! Each adapter lives in its own file and is gated behind a feature flag.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{EngineConfig, ResolvedConnectorConfig};
use crate::error::{MetricsViewError, Result};
use crate::olap::Olap;

/// Engines keyed by connector name, plus the configuration they run under.
#[derive(Clone, Default)]
pub struct ConnectorManager {
    connectors: HashMap<String, Arc<dyn Olap>>,
    default_connector: Option<String>,
    config: EngineConfig,
}

impl ConnectorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_for(&self, name: &str) -> ResolvedConnectorConfig {
        self.config.for_connector(name)
    }

    /// Register an engine. The first one registered serves views that name
    /// no connector.
    pub fn insert(&mut self, name: impl Into<String>, olap: Arc<dyn Olap>) {
        let name = name.into();
        if self.default_connector.is_none() {
            self.default_connector = Some(name.clone());
        }
        self.connectors.insert(name, olap);
    }

    /// Register a DuckDB engine under the `[duckdb]` limits configured for
    /// `name`. The returned handle shares the registered engine's pool.
    #[cfg(feature = "duckdb")]
    pub fn insert_duckdb(&mut self, name: impl Into<String>, olap: DuckDbOlap) -> DuckDbOlap {
        let name = name.into();
        let olap = olap.with_config(&self.config_for(&name).duckdb);
        tracing::debug!(connector = %name, max_concurrency = olap.max_concurrency(), "registering DuckDB connector");
        self.insert(name, Arc::new(olap.clone()));
        olap
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Olap>> {
        let key = if name.is_empty() {
            self.default_connector.as_deref().unwrap_or_default()
        } else {
            name
        };
        self.connectors
            .get(key)
            .cloned()
            .ok_or_else(|| MetricsViewError::Config(format!("connector '{name}' is not registered")))
    }

    /// Name used for configuration lookups of `name`.
    pub fn resolve_name<'a>(&'a self, name: &'a str) -> &'a str {
        if name.is_empty() {
            self.default_connector.as_deref().unwrap_or_default()
        } else {
            name
        }
    }
}

#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::{DuckDbConnection, DuckDbOlap};
