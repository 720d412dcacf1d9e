use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::expression::Expression;
use crate::models::{DimensionRequest, MeasureRequest, Sort, TimeRange};
use crate::pivot::{PivotLayout, PivotRequest};
use crate::result::QueryResult;
use crate::runtime::Runtime;
use crate::security::SecurityClaims;

use super::{CacheableQuery, ResourceName};

/// Grouped measures by any number of dimensions, optionally pivoted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationQuery {
    pub metrics_view: String,
    pub dimensions: Vec<DimensionRequest>,
    pub measures: Vec<MeasureRequest>,
    #[serde(rename = "where")]
    pub where_clause: Option<Expression>,
    pub having: Option<Expression>,
    pub time_range: Option<TimeRange>,
    pub sort: Vec<Sort>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Dimensions whose values become columns.
    pub pivot_on: Vec<String>,
}

#[async_trait]
impl CacheableQuery for AggregationQuery {
    type Output = QueryResult;
    const KIND: &'static str = "MetricsViewAggregation";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::metrics_view(&self.metrics_view)]
    }

    async fn resolve(&self, rt: &Runtime, claims: &SecurityClaims) -> Result<QueryResult> {
        let ctx = rt.view_context(&self.metrics_view, claims)?;
        let sql = ctx.builder()?.build_aggregation(self)?;
        if self.pivot_on.is_empty() {
            return ctx.execute(sql).await;
        }

        let dimensions: Vec<String> = self.dimensions.iter().map(|d| d.output_name().to_string()).collect();
        let measures: Vec<String> = self.measures.iter().map(|m| m.name.clone()).collect();
        let layout = PivotLayout::new(&dimensions, &measures, &self.pivot_on)?
            .with_sort(&self.sort)
            .with_limit(self.limit);
        let req = PivotRequest {
            sql,
            layout,
            priority: ctx.config.query.priority,
            timeout: ctx.config.query.timeout(),
        };
        let result = rt.pivot_engine(&ctx.config.pivot).run(ctx.olap.as_ref(), &req).await?;
        result.set_cap(ctx.config.query.result_cap)?;
        Ok(result)
    }
}
