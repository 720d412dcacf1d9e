//! Resolvable queries.
//!
//! Every query is a plain serde struct. [`CacheableQuery`] gives it a stable
//! cache key, the resources it reads, a byte encoding of its output and an
//! async `resolve` against a [`Runtime`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ResolvedConnectorConfig;
use crate::error::{MetricsViewError, Result};
use crate::models::MetricsViewSpec;
use crate::olap::{Olap, Statement};
use crate::query_builder::MetricsViewBuilder;
use crate::result::QueryResult;
use crate::runtime::Runtime;
use crate::security::{ResolvedSecurity, SecurityClaims};
use crate::sql_ast::SqlFragment;

mod aggregation;
mod column_timeseries;
mod comparison;
mod histogram;
mod rows;
mod schema;
mod search;
mod timeseries;
mod toplist;
mod totals;

pub use aggregation::AggregationQuery;
pub use column_timeseries::{ColumnMeasure, ColumnTimeseriesQuery, ColumnTimeseriesResult};
pub use comparison::{ComparisonMeasureValue, ComparisonQuery, ComparisonResult, ComparisonRow};
pub use histogram::{HistogramBin, HistogramMethod, NumericHistogramQuery};
pub use rows::RowsQuery;
pub use schema::SchemaQuery;
pub use search::{SearchMatch, SearchQuery};
pub use timeseries::{TimeseriesPoint, TimeseriesQuery, TimeseriesResult};
pub use toplist::ToplistQuery;
pub use totals::TotalsQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    MetricsView,
    Model,
}

/// A resource a query reads. Caches invalidate on changes to any of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceName {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceName {
    pub fn metrics_view(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::MetricsView,
            name: name.into(),
        }
    }

    pub fn model(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Model,
            name: name.into(),
        }
    }
}

#[async_trait]
pub trait CacheableQuery: Serialize + Send + Sync {
    type Output: Serialize + DeserializeOwned + Send;

    /// Prefix of the cache key and of unmarshal errors.
    const KIND: &'static str;

    /// `<KIND>:<canonical JSON of the query>`. Object keys are sorted at
    /// every depth.
    fn key(&self) -> Result<String> {
        let canonical = canonicalize(serde_json::to_value(self)?);
        Ok(format!("{}:{}", Self::KIND, serde_json::to_string(&canonical)?))
    }

    fn deps(&self) -> Vec<ResourceName>;

    fn marshal_result(&self, output: &Self::Output) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(output)?)
    }

    fn unmarshal_result(&self, bytes: &[u8]) -> Result<Self::Output> {
        serde_json::from_slice(bytes)
            .map_err(|_| MetricsViewError::Validation(format!("{}: mismatched unmarshal input", Self::KIND)))
    }

    async fn resolve(&self, rt: &Runtime, claims: &SecurityClaims) -> Result<Self::Output>;
}

/// Everything a metrics-view query needs once the view is looked up.
pub(crate) struct ViewContext<'r> {
    pub view: &'r MetricsViewSpec,
    pub security: ResolvedSecurity,
    pub olap: Arc<dyn Olap>,
    pub config: ResolvedConnectorConfig,
}

impl ViewContext<'_> {
    /// Builder bound to the engine's dialect and the connector's limits.
    pub fn builder(&self) -> Result<MetricsViewBuilder<'_>> {
        Ok(MetricsViewBuilder::new(self.view, &self.security)?
            .with_dialect(self.olap.dialect())
            .with_default_limit(self.config.query.default_limit))
    }

    /// Execute and enforce the result cap.
    pub async fn execute(&self, sql: SqlFragment) -> Result<QueryResult> {
        execute_capped(self.olap.as_ref(), &self.config, sql).await
    }
}

pub(crate) fn statement(config: &ResolvedConnectorConfig, sql: SqlFragment) -> Statement {
    Statement::from(sql)
        .with_priority(config.query.priority)
        .with_timeout(config.query.timeout())
}

pub(crate) async fn execute_capped(
    olap: &dyn Olap,
    config: &ResolvedConnectorConfig,
    sql: SqlFragment,
) -> Result<QueryResult> {
    let result = olap.execute(&statement(config, sql)).await?;
    result.set_cap(config.query.result_cap)?;
    Ok(result)
}

/// A JSON number, or a numeric string, as `f64`.
pub(crate) fn number(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, canonicalize(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
