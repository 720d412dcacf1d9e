//! Composition root: views, engines, security and configuration, wired by
//! the caller.

use std::sync::Arc;
use std::time::Instant;

use crate::backends::ConnectorManager;
use crate::config::{PivotConfig, ResolvedConnectorConfig};
use crate::error::{MetricsViewError, Result};
use crate::models::MetricsViewSpec;
use crate::olap::Olap;
use crate::pivot::PivotEngine;
use crate::queries::{CacheableQuery, ViewContext};
use crate::registry::MetricsViewRegistry;
use crate::security::{DefaultSecurityResolver, ResolvedSecurity, SecurityClaims, SecurityResolver};

pub struct Runtime {
    registry: MetricsViewRegistry,
    connectors: ConnectorManager,
    security: Arc<dyn SecurityResolver>,
    #[cfg(feature = "duckdb")]
    local: Option<crate::backends::DuckDbOlap>,
}

impl Runtime {
    pub fn new(registry: MetricsViewRegistry, connectors: ConnectorManager) -> Self {
        Self {
            registry,
            connectors,
            security: Arc::new(DefaultSecurityResolver),
            #[cfg(feature = "duckdb")]
            local: None,
        }
    }

    pub fn with_security_resolver(mut self, resolver: Arc<dyn SecurityResolver>) -> Self {
        self.security = resolver;
        self
    }

    /// Local engine used to pivot results of engines without a native `PIVOT`.
    #[cfg(feature = "duckdb")]
    pub fn with_local_engine(mut self, local: crate::backends::DuckDbOlap) -> Self {
        self.local = Some(local);
        self
    }

    pub fn registry(&self) -> &MetricsViewRegistry {
        &self.registry
    }

    pub fn connectors(&self) -> &ConnectorManager {
        &self.connectors
    }

    pub fn view(&self, name: &str) -> Result<&MetricsViewSpec> {
        self.registry.get(name).ok_or_else(|| MetricsViewError::UnknownReference {
            kind: "metrics view",
            name: name.to_string(),
        })
    }

    /// Engine registered under `connector`; empty selects the default.
    pub fn olap(&self, connector: &str) -> Result<Arc<dyn Olap>> {
        self.connectors.get(connector)
    }

    pub fn connector_config(&self, connector: &str) -> ResolvedConnectorConfig {
        self.connectors.config_for(self.connectors.resolve_name(connector))
    }

    pub fn security_for(&self, view: &MetricsViewSpec, claims: &SecurityClaims) -> Result<ResolvedSecurity> {
        self.security.resolve(view, claims)
    }

    pub(crate) fn view_context(&self, name: &str, claims: &SecurityClaims) -> Result<ViewContext<'_>> {
        let view = self.view(name)?;
        Ok(ViewContext {
            view,
            security: self.security_for(view, claims)?,
            olap: self.olap(&view.connector)?,
            config: self.connector_config(&view.connector),
        })
    }

    pub fn pivot_engine(&self, config: &PivotConfig) -> PivotEngine {
        let engine = PivotEngine::new(config);
        #[cfg(feature = "duckdb")]
        let engine = match &self.local {
            Some(local) => engine.with_local(local.clone()),
            None => engine,
        };
        engine
    }

    pub async fn resolve<Q: CacheableQuery>(&self, query: &Q, claims: &SecurityClaims) -> Result<Q::Output> {
        let start = Instant::now();
        let result = query.resolve(self, claims).await;
        match &result {
            Ok(_) => tracing::debug!(kind = Q::KIND, ms = start.elapsed().as_millis(), "resolved query"),
            Err(err) => tracing::debug!(kind = Q::KIND, error = %err, "query failed"),
        }
        result
    }
}
