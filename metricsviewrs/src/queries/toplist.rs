use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::expression::Expression;
use crate::models::{MeasureRequest, Sort, TimeRange};
use crate::result::QueryResult;
use crate::runtime::Runtime;
use crate::security::SecurityClaims;

use super::{CacheableQuery, ResourceName};

/// Top values of one dimension ranked by measures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToplistQuery {
    pub metrics_view: String,
    pub dimension: String,
    pub measures: Vec<MeasureRequest>,
    #[serde(rename = "where")]
    pub where_clause: Option<Expression>,
    pub having: Option<Expression>,
    pub time_range: Option<TimeRange>,
    pub sort: Vec<Sort>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[async_trait]
impl CacheableQuery for ToplistQuery {
    type Output = QueryResult;
    const KIND: &'static str = "MetricsViewToplist";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::metrics_view(&self.metrics_view)]
    }

    async fn resolve(&self, rt: &Runtime, claims: &SecurityClaims) -> Result<QueryResult> {
        let ctx = rt.view_context(&self.metrics_view, claims)?;
        let sql = ctx.builder()?.build_toplist(self)?;
        ctx.execute(sql).await
    }
}
