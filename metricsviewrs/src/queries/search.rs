use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::expression::Expression;
use crate::models::TimeRange;
use crate::query_builder::{SEARCH_DIMENSION_COLUMN, SEARCH_VALUE_COLUMN};
use crate::runtime::Runtime;
use crate::security::SecurityClaims;

use super::{CacheableQuery, ResourceName};

/// Dimension values containing a search term, case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub metrics_view: String,
    /// Empty searches every accessible dimension.
    pub dimensions: Vec<String>,
    pub search: String,
    #[serde(rename = "where")]
    pub where_clause: Option<Expression>,
    pub time_range: Option<TimeRange>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub dimension: String,
    pub value: Value,
}

#[async_trait]
impl CacheableQuery for SearchQuery {
    type Output = Vec<SearchMatch>;
    const KIND: &'static str = "MetricsViewSearch";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::metrics_view(&self.metrics_view)]
    }

    async fn resolve(&self, rt: &Runtime, claims: &SecurityClaims) -> Result<Vec<SearchMatch>> {
        let ctx = rt.view_context(&self.metrics_view, claims)?;
        let sql = ctx.builder()?.build_search(self)?;
        let result = ctx.execute(sql).await?;
        Ok(result
            .rows
            .into_iter()
            .map(|mut row| SearchMatch {
                dimension: match row.remove(SEARCH_DIMENSION_COLUMN) {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
                value: row.remove(SEARCH_VALUE_COLUMN).unwrap_or(Value::Null),
            })
            .collect())
    }
}
