use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bucketing::{
    diagnostic_bucket_count, freedman_diaconis_buckets, nice_and_step, HistogramStats, MAX_BUCKETS,
};
use crate::config::ResolvedConnectorConfig;
use crate::error::Result;
use crate::olap::Olap;
use crate::query_builder::{histogram_bucket_sql, histogram_minmax_sql, histogram_stats_sql};
use crate::runtime::Runtime;
use crate::security::SecurityClaims;

use super::{execute_capped, number, CacheableQuery, ResourceName};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramMethod {
    /// Freedman–Diaconis bucket width.
    #[default]
    Fd,
    /// Nice round bucket edges for inspecting a column.
    Diagnostic,
}

/// Histogram of a numeric column of a table or model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericHistogramQuery {
    pub connector: String,
    pub table: String,
    pub column: String,
    pub method: HistogramMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub bucket: u64,
    pub low: f64,
    pub high: f64,
    pub midpoint: f64,
    pub count: u64,
}

fn to_bins(rows: &[Map<String, Value>]) -> Vec<HistogramBin> {
    rows.iter()
        .filter_map(|row| {
            let low = number(row.get("low"))?;
            let high = number(row.get("high"))?;
            Some(HistogramBin {
                bucket: number(row.get("bucket")).unwrap_or(0.0) as u64,
                low,
                high,
                midpoint: (low + high) / 2.0,
                count: number(row.get("count")).unwrap_or(0.0) as u64,
            })
        })
        .collect()
}

/// `(buckets, low, width)` of an equal-width layout, `None` for empty columns.
type Layout = Option<(u64, f64, f64)>;

impl NumericHistogramQuery {
    async fn min_max(&self, olap: &dyn Olap, config: &ResolvedConnectorConfig, table: &str) -> Result<Option<(f64, f64)>> {
        let sql = histogram_minmax_sql(olap.dialect(), table, &self.column)?;
        let result = execute_capped(olap, config, sql).await?;
        let row = result.rows.first();
        Ok(match (number(row.and_then(|r| r.get("min"))), number(row.and_then(|r| r.get("max")))) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        })
    }

    async fn fd_layout(&self, olap: &dyn Olap, config: &ResolvedConnectorConfig, table: &str) -> Result<Layout> {
        let sql = histogram_stats_sql(olap.dialect(), table, &self.column)?;
        let stats = execute_capped(olap, config, sql).await?;
        let row = stats.rows.first();
        let stats = HistogramStats {
            iqr: number(row.and_then(|r| r.get("iqr"))),
            approx_distinct: number(row.and_then(|r| r.get("count"))).map(|c| c as u64),
            range: number(row.and_then(|r| r.get("range"))),
        };
        let buckets = freedman_diaconis_buckets(&stats);
        if buckets == 0 {
            return Ok(None);
        }
        let Some((min, max)) = self.min_max(olap, config, table).await? else {
            return Ok(None);
        };
        let width = (max - min) / buckets as f64;
        Ok((width > 0.0).then_some((buckets, min, width)))
    }

    async fn diagnostic_layout(
        &self,
        olap: &dyn Olap,
        config: &ResolvedConnectorConfig,
        table: &str,
    ) -> Result<Layout> {
        let Some((min, max)) = self.min_max(olap, config, table).await? else {
            return Ok(None);
        };
        let ticks = (max - min).min(MAX_BUCKETS as f64);
        let (start, end, gap) = nice_and_step(min, max, ticks);
        let buckets = diagnostic_bucket_count(start, end, gap);
        Ok((buckets > 0).then_some((buckets, start, gap)))
    }
}

#[async_trait]
impl CacheableQuery for NumericHistogramQuery {
    type Output = Vec<HistogramBin>;
    const KIND: &'static str = "ColumnNumericHistogram";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::model(&self.table)]
    }

    async fn resolve(&self, rt: &Runtime, _claims: &SecurityClaims) -> Result<Vec<HistogramBin>> {
        let olap = rt.olap(&self.connector)?;
        let config = rt.connector_config(&self.connector);
        let dialect = olap.dialect();
        let table = dialect.escape_identifier(&self.table);

        let layout = match self.method {
            HistogramMethod::Fd => self.fd_layout(olap.as_ref(), &config, &table).await?,
            HistogramMethod::Diagnostic => self.diagnostic_layout(olap.as_ref(), &config, &table).await?,
        };
        let Some((buckets, low, width)) = layout else {
            tracing::debug!(table = %self.table, column = %self.column, "histogram over empty or constant column");
            return Ok(Vec::new());
        };
        let sql = histogram_bucket_sql(dialect, &table, &self.column, buckets, low, width)?;
        let result = execute_capped(olap.as_ref(), &config, sql).await?;
        Ok(to_bins(&result.rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bins_carry_midpoints() {
        let rows: Vec<Map<String, Value>> = vec![
            serde_json::from_value(json!({"bucket": 0.0, "low": 0.0, "high": 2.0, "count": 4})).unwrap(),
            serde_json::from_value(json!({"bucket": 1.0, "low": 2.0, "high": 4.0, "count": 0})).unwrap(),
        ];
        let bins = to_bins(&rows);
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].midpoint, 1.0);
        assert_eq!(bins[0].count, 4);
        assert_eq!(bins[1].bucket, 1);
    }

    #[test]
    fn method_parses_snake_case() {
        let q: NumericHistogramQuery =
            serde_json::from_value(json!({"table": "t", "column": "x", "method": "diagnostic"})).unwrap();
        assert_eq!(q.method, HistogramMethod::Diagnostic);
        assert_eq!(q.deps(), vec![ResourceName::model("t")]);
    }
}
