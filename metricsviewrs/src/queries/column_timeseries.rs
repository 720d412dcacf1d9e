use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bucketing::m4_rollup;
use crate::dialect::{temp_name, DialectKind};
use crate::error::{MetricsViewError, Result};
use crate::models::TimeRange;
use crate::olap::EnsuredDrop;
use crate::query_builder::{column_timeseries_sql, spine_sql, ColumnSeriesSql, SPINE_COLUMN};
use crate::result::parse_timestamp;
use crate::runtime::Runtime;
use crate::security::SecurityClaims;
use crate::sql_ast::SqlFragment;
use crate::timeutil::{self, TimeGrain};

use super::{number, statement, CacheableQuery, ResourceName, TimeseriesPoint};

/// Longest spine a single request may generate.
const MAX_SPINE_POINTS: usize = 100_000;

const COUNT_MEASURE: &str = "count";

/// An aggregate over the raw table, e.g. `avg(price)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMeasure {
    pub expression: String,
    pub name: String,
}

/// Gap-free series over a timestamp column of a table or model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnTimeseriesQuery {
    /// Empty uses the default connector.
    pub connector: String,
    pub table: String,
    pub timestamp_column: String,
    /// Empty counts rows.
    pub measures: Vec<ColumnMeasure>,
    /// Missing bounds are read from the column.
    pub time_range: Option<TimeRange>,
    pub grain: TimeGrain,
    pub time_zone: String,
    /// Spark line width. Zero falls back to the configured default.
    pub pixels: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnTimeseriesResult {
    pub data: Vec<TimeseriesPoint>,
    /// M4-reduced copy of `data`, empty when no width applies.
    pub spark: Vec<TimeseriesPoint>,
}

impl ColumnTimeseriesQuery {
    /// `(alias, expression)` pairs. A count is added when a spark is drawn.
    fn normalized_measures(&self, pixels: usize) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .measures
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let name = if m.name.is_empty() {
                    format!("measure_{i}")
                } else {
                    m.name.clone()
                };
                (name, m.expression.clone())
            })
            .collect();
        let has_count = out.iter().any(|(name, _)| name == COUNT_MEASURE);
        if out.is_empty() || (pixels > 0 && !has_count) {
            out.push((COUNT_MEASURE.to_string(), "count(*)".to_string()));
        }
        out
    }
}

fn spine_points(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    grain: TimeGrain,
    tz: chrono_tz::Tz,
) -> Result<Vec<DateTime<Utc>>> {
    let mut points = Vec::new();
    let mut cursor = timeutil::truncate_time(start, grain, tz, 1, 1);
    while cursor < end {
        if points.len() >= MAX_SPINE_POINTS {
            return Err(MetricsViewError::CapacityExceeded(format!(
                "time series spans more than {MAX_SPINE_POINTS} {} buckets",
                grain.as_str()
            )));
        }
        points.push(cursor);
        let next = timeutil::offset_time(cursor, grain, 1, tz);
        if next <= cursor {
            break;
        }
        cursor = next;
    }
    Ok(points)
}

fn to_points(rows: Vec<Map<String, Value>>) -> Vec<TimeseriesPoint> {
    rows.into_iter()
        .filter_map(|mut row| {
            let ts = row.remove(SPINE_COLUMN).as_ref().and_then(parse_timestamp)?;
            Some(TimeseriesPoint { ts, records: row })
        })
        .collect()
}

#[async_trait]
impl CacheableQuery for ColumnTimeseriesQuery {
    type Output = ColumnTimeseriesResult;
    const KIND: &'static str = "ColumnTimeseries";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::model(&self.table)]
    }

    async fn resolve(&self, rt: &Runtime, _claims: &SecurityClaims) -> Result<ColumnTimeseriesResult> {
        let olap = rt.olap(&self.connector)?;
        let config = rt.connector_config(&self.connector);
        let dialect = olap.dialect();
        if dialect.kind() != DialectKind::DuckDb {
            return Err(MetricsViewError::unsupported_dialect("column time series", dialect.name()));
        }
        if self.grain == TimeGrain::Unspecified {
            return Err(MetricsViewError::Validation(
                "column time series requires a time grain".to_string(),
            ));
        }
        let tz = timeutil::parse_time_zone(&self.time_zone)?;
        let sql_tz = if timeutil::is_utc(&self.time_zone) { "" } else { self.time_zone.as_str() };
        let pixels = if self.pixels > 0 { self.pixels } else { config.timeseries.pixels };
        let measures = self.normalized_measures(pixels);
        let table = dialect.escape_identifier(&self.table);
        let ts_col = dialect.escape_identifier(&self.timestamp_column);

        let conn = olap.acquire(config.query.priority).await?;

        let mut start = self.time_range.as_ref().and_then(|r| r.start);
        let mut end = self.time_range.as_ref().and_then(|r| r.end);
        if start.is_none() || end.is_none() {
            let bounds = conn
                .execute(&statement(
                    &config,
                    SqlFragment::raw(format!(
                        "SELECT min({ts_col}) AS \"min\", max({ts_col}) AS \"max\" FROM {table}"
                    )),
                ))
                .await?;
            let row = bounds.rows.first();
            start = start.or_else(|| row.and_then(|r| r.get("min")).and_then(parse_timestamp));
            end = end.or_else(|| {
                row.and_then(|r| r.get("max"))
                    .and_then(parse_timestamp)
                    .map(|max| timeutil::offset_time(max, self.grain, 1, tz))
            });
        }
        let (Some(start), Some(end)) = (start, end) else {
            return Ok(ColumnTimeseriesResult::default());
        };

        let points = spine_points(start, end, self.grain, tz)?;
        if points.is_empty() {
            return Ok(ColumnTimeseriesResult::default());
        }

        let spine = temp_name("__timeseries_");
        conn.exec(&statement(&config, spine_sql(dialect, &spine, &points)?)).await?;
        let guard = EnsuredDrop::new(conn.clone(), spine.clone());

        let sql = column_timeseries_sql(
            dialect,
            &ColumnSeriesSql {
                spine_table: &spine,
                table: &table,
                timestamp_column: &self.timestamp_column,
                measures: &measures,
                grain: self.grain,
                time_zone: sql_tz,
                start: points[0],
                end,
            },
        )?;
        let result = conn.execute(&statement(&config, sql)).await?;
        guard.finish().await?;
        result.set_cap(config.query.result_cap)?;

        let data = to_points(result.rows);
        let spark = if pixels > 0 {
            m4_rollup(&data, pixels, |p| {
                (p.ts.timestamp_millis(), number(p.records.get(COUNT_MEASURE)))
            })
        } else {
            Vec::new()
        };
        tracing::debug!(
            table = %self.table,
            points = data.len(),
            spark = spark.len(),
            "resolved column time series"
        );
        Ok(ColumnTimeseriesResult { data, spark })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    #[test]
    fn measures_get_names_and_a_count() {
        let q = ColumnTimeseriesQuery {
            measures: vec![ColumnMeasure {
                expression: "avg(price)".into(),
                name: String::new(),
            }],
            ..Default::default()
        };
        assert_eq!(
            q.normalized_measures(0),
            vec![("measure_0".to_string(), "avg(price)".to_string())]
        );
        assert_eq!(q.normalized_measures(10).len(), 2);
        assert_eq!(
            ColumnTimeseriesQuery::default().normalized_measures(0),
            vec![("count".to_string(), "count(*)".to_string())]
        );
    }

    #[test]
    fn spine_is_truncated_and_bounded() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap();
        let points = spine_points(start, end, TimeGrain::Day, Tz::UTC).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let far = Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            spine_points(start, far, TimeGrain::Minute, Tz::UTC),
            Err(MetricsViewError::CapacityExceeded(_))
        ));
    }
}
