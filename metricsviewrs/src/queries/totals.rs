use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::expression::Expression;
use crate::models::{MeasureRequest, TimeRange};
use crate::runtime::Runtime;
use crate::security::SecurityClaims;

use super::{CacheableQuery, ResourceName};

/// Measures over the whole filtered view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TotalsQuery {
    pub metrics_view: String,
    pub measures: Vec<MeasureRequest>,
    #[serde(rename = "where")]
    pub where_clause: Option<Expression>,
    pub time_range: Option<TimeRange>,
}

#[async_trait]
impl CacheableQuery for TotalsQuery {
    /// Measure name to value. Every requested measure is present.
    type Output = Map<String, Value>;
    const KIND: &'static str = "MetricsViewTotals";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::metrics_view(&self.metrics_view)]
    }

    async fn resolve(&self, rt: &Runtime, claims: &SecurityClaims) -> Result<Map<String, Value>> {
        let ctx = rt.view_context(&self.metrics_view, claims)?;
        let sql = ctx.builder()?.build_totals(self)?;
        let result = ctx.execute(sql).await?;
        let mut row = result.rows.into_iter().next().unwrap_or_default();
        for m in &self.measures {
            row.entry(m.name.clone()).or_insert(Value::Null);
        }
        Ok(row)
    }
}
