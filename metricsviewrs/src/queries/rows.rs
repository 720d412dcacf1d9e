use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::expression::Expression;
use crate::models::{Sort, TimeRange};
use crate::result::QueryResult;
use crate::runtime::Runtime;
use crate::security::SecurityClaims;
use crate::timeutil::TimeGrain;

use super::{CacheableQuery, ResourceName};

/// Underlying rows of a view, restricted to accessible columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowsQuery {
    pub metrics_view: String,
    /// Empty selects every accessible column.
    pub columns: Vec<String>,
    #[serde(rename = "where")]
    pub where_clause: Option<Expression>,
    pub time_range: Option<TimeRange>,
    pub sort: Vec<Sort>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Adds a `<time>__<grain>` column when set.
    pub time_grain: TimeGrain,
    pub time_zone: String,
}

#[async_trait]
impl CacheableQuery for RowsQuery {
    type Output = QueryResult;
    const KIND: &'static str = "MetricsViewRows";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::metrics_view(&self.metrics_view)]
    }

    async fn resolve(&self, rt: &Runtime, claims: &SecurityClaims) -> Result<QueryResult> {
        let ctx = rt.view_context(&self.metrics_view, claims)?;
        let sql = ctx.builder()?.build_rows(self)?;
        ctx.execute(sql).await
    }
}
