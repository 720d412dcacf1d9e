use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::expression::Expression;
use crate::models::{DimensionRequest, MeasureRequest, Sort, TimeRange};
use crate::query_builder::{delta_abs_alias, delta_rel_alias, previous_alias, ComparisonPlan};
use crate::runtime::Runtime;
use crate::security::SecurityClaims;

use super::{CacheableQuery, ResourceName};

/// Toplist of one dimension over a base range, compared with a second range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonQuery {
    pub metrics_view: String,
    pub dimension: DimensionRequest,
    pub measures: Vec<MeasureRequest>,
    /// Measures to compare. Empty compares every non-builtin measure when a
    /// comparison range is set.
    pub comparison_measures: Vec<String>,
    pub time_range: Option<TimeRange>,
    pub comparison_time_range: Option<TimeRange>,
    #[serde(rename = "where")]
    pub where_clause: Option<Expression>,
    pub having: Option<Expression>,
    pub sort: Vec<Sort>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Join complete ranges instead of limiting the driving side first.
    pub exact: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonMeasureValue {
    pub name: String,
    pub base_value: Value,
    pub comparison_value: Value,
    pub delta_abs: Value,
    pub delta_rel: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub dimension_value: Value,
    pub measure_values: Vec<ComparisonMeasureValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub rows: Vec<ComparisonRow>,
}

fn to_row(plan: &ComparisonPlan, mut row: Map<String, Value>) -> ComparisonRow {
    let mut take = |name: &str| row.remove(name).unwrap_or(Value::Null);
    let dimension_value = take(&plan.dimension);
    let measure_values = plan
        .measures
        .iter()
        .map(|m| {
            let base_value = take(m);
            if !plan.compared.contains(m) {
                return ComparisonMeasureValue {
                    name: m.clone(),
                    base_value,
                    comparison_value: Value::Null,
                    delta_abs: Value::Null,
                    delta_rel: Value::Null,
                };
            }
            ComparisonMeasureValue {
                name: m.clone(),
                base_value,
                comparison_value: take(&previous_alias(m)),
                delta_abs: take(&delta_abs_alias(m)),
                delta_rel: take(&delta_rel_alias(m)),
            }
        })
        .collect();
    ComparisonRow {
        dimension_value,
        measure_values,
    }
}

#[async_trait]
impl CacheableQuery for ComparisonQuery {
    type Output = ComparisonResult;
    const KIND: &'static str = "MetricsViewComparison";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::metrics_view(&self.metrics_view)]
    }

    async fn resolve(&self, rt: &Runtime, claims: &SecurityClaims) -> Result<ComparisonResult> {
        let ctx = rt.view_context(&self.metrics_view, claims)?;
        let plan = ctx.builder()?.build_comparison(self)?;
        let result = ctx.execute(plan.sql.clone()).await?;
        Ok(ComparisonResult {
            rows: result.rows.into_iter().map(|row| to_row(&plan, row)).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_ast::SqlFragment;
    use serde_json::json;

    #[test]
    fn splits_aliases_into_measure_values() {
        let plan = ComparisonPlan {
            sql: SqlFragment::default(),
            dimension: "country".into(),
            measures: vec!["revenue".into(), "orders".into()],
            compared: vec!["revenue".into()],
        };
        let row: Map<String, Value> = serde_json::from_value(json!({
            "country": "US",
            "revenue": 10.0,
            "orders": 3,
            "revenue__previous": 12.0,
            "revenue__delta_abs": 2.0,
            "revenue__delta_rel": 0.2,
        }))
        .unwrap();
        let out = to_row(&plan, row);
        assert_eq!(out.dimension_value, json!("US"));
        assert_eq!(out.measure_values[0].comparison_value, json!(12.0));
        assert_eq!(out.measure_values[0].delta_rel, json!(0.2));
        assert_eq!(out.measure_values[1].base_value, json!(3));
        assert_eq!(out.measure_values[1].delta_abs, Value::Null);
    }
}
