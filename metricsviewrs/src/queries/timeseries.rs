use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::expression::Expression;
use crate::models::{MeasureRequest, TimeRange};
use crate::query_builder::SPINE_COLUMN;
use crate::result::{parse_timestamp, ColumnMeta};
use crate::runtime::Runtime;
use crate::security::SecurityClaims;
use crate::timeutil::{self, TimeGrain};

use super::{CacheableQuery, ResourceName};

/// Measures per time bucket of the view's time dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeseriesQuery {
    pub metrics_view: String,
    pub measures: Vec<MeasureRequest>,
    /// Buckets between `start` and `end` with no data come back as nulls.
    pub time_range: Option<TimeRange>,
    pub time_grain: TimeGrain,
    pub time_zone: String,
    #[serde(rename = "where")]
    pub where_clause: Option<Expression>,
    pub having: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesPoint {
    pub ts: DateTime<Utc>,
    pub records: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesResult {
    pub meta: Vec<ColumnMeta>,
    pub data: Vec<TimeseriesPoint>,
}

/// Calendar parameters of gap filling.
struct Calendar {
    grain: TimeGrain,
    tz: Tz,
    first_day_of_week: u32,
    first_month_of_year: u32,
}

impl Calendar {
    fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        timeutil::truncate_time(t, self.grain, self.tz, self.first_day_of_week, self.first_month_of_year)
    }

    fn next(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        timeutil::offset_time(t, self.grain, 1, self.tz)
    }
}

fn null_point(ts: DateTime<Utc>, measures: &[String]) -> TimeseriesPoint {
    TimeseriesPoint {
        ts,
        records: measures.iter().map(|m| (m.clone(), Value::Null)).collect(),
    }
}

/// Most null points a single gap may add.
const MAX_GAP_POINTS: usize = 5000;

/// Push null points for every bucket in `[from, until)`, at most
/// [`MAX_GAP_POINTS`] of them.
fn fill_gap(
    out: &mut Vec<TimeseriesPoint>,
    cal: &Calendar,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    measures: &[String],
) {
    let mut cursor = from;
    let mut added = 0;
    while cursor < until {
        if added == MAX_GAP_POINTS {
            tracing::debug!(from = %from, until = %until, "null fill stopped at gap limit");
            break;
        }
        added += 1;
        out.push(null_point(cursor, measures));
        let next = cal.next(cursor);
        if next <= cursor {
            break;
        }
        cursor = next;
    }
}

/// Interleave engine rows with null buckets so the series has no holes.
fn fill_series(
    rows: Vec<Map<String, Value>>,
    cal: &Calendar,
    range: Option<&TimeRange>,
    measures: &[String],
) -> Vec<TimeseriesPoint> {
    let mut out = Vec::with_capacity(rows.len());
    let mut cursor = range.and_then(|r| r.start).map(|s| cal.truncate(s));
    for mut row in rows {
        let Some(ts) = row.remove(SPINE_COLUMN).as_ref().and_then(parse_timestamp) else {
            continue;
        };
        if let Some(from) = cursor {
            fill_gap(&mut out, cal, from, ts, measures);
        }
        out.push(TimeseriesPoint { ts, records: row });
        cursor = Some(cal.next(ts));
    }
    if let (Some(from), Some(end)) = (cursor, range.and_then(|r| r.end)) {
        fill_gap(&mut out, cal, from, end, measures);
    }
    out
}

#[async_trait]
impl CacheableQuery for TimeseriesQuery {
    type Output = TimeseriesResult;
    const KIND: &'static str = "MetricsViewTimeSeries";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::metrics_view(&self.metrics_view)]
    }

    async fn resolve(&self, rt: &Runtime, claims: &SecurityClaims) -> Result<TimeseriesResult> {
        let ctx = rt.view_context(&self.metrics_view, claims)?;
        let sql = ctx.builder()?.build_timeseries(self)?;
        let result = ctx.execute(sql).await?;

        let cal = Calendar {
            grain: self.time_grain,
            tz: timeutil::parse_time_zone(&self.time_zone)?,
            first_day_of_week: timeutil::clamp_first_day_of_week(ctx.view.first_day_of_week),
            first_month_of_year: timeutil::clamp_first_month_of_year(ctx.view.first_month_of_year),
        };
        let measures: Vec<String> = self.measures.iter().map(|m| m.name.clone()).collect();
        let data = fill_series(result.rows, &cal, self.time_range.as_ref(), &measures);
        tracing::debug!(view = %self.metrics_view, points = data.len(), "resolved time series");
        Ok(TimeseriesResult {
            meta: result.schema.fields,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::timestamp_to_json;
    use chrono::TimeZone;
    use serde_json::json;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn row(d: u32, n: i64) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("ts".into(), timestamp_to_json(day(d)));
        row.insert("n".into(), json!(n));
        row
    }

    fn calendar() -> Calendar {
        Calendar {
            grain: TimeGrain::Day,
            tz: Tz::UTC,
            first_day_of_week: 1,
            first_month_of_year: 1,
        }
    }

    #[test]
    fn fills_leading_inner_and_trailing_gaps() {
        let range = TimeRange::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(), day(6));
        let measures = vec!["n".to_string()];
        let data = fill_series(vec![row(2, 5), row(4, 7)], &calendar(), Some(&range), &measures);
        let days: Vec<DateTime<Utc>> = data.iter().map(|p| p.ts).collect();
        assert_eq!(days, vec![day(1), day(2), day(3), day(4), day(5)]);
        assert_eq!(data[0].records["n"], Value::Null);
        assert_eq!(data[1].records["n"], json!(5));
        assert_eq!(data[2].records["n"], Value::Null);
        assert_eq!(data[4].records["n"], Value::Null);
    }

    #[test]
    fn wide_gaps_stop_at_the_limit() {
        let cal = Calendar {
            grain: TimeGrain::Second,
            ..calendar()
        };
        let range = TimeRange::new(day(1), day(3));
        let measures = vec!["n".to_string()];
        let data = fill_series(Vec::new(), &cal, Some(&range), &measures);
        assert_eq!(data.len(), MAX_GAP_POINTS);
        assert_eq!(data[0].ts, day(1));

        let data = fill_series(vec![row(2, 5)], &cal, Some(&range), &measures);
        assert_eq!(data.len(), 2 * MAX_GAP_POINTS + 1);
        assert_eq!(data[MAX_GAP_POINTS].records["n"], json!(5));
    }

    #[test]
    fn without_range_only_inner_gaps_fill() {
        let measures = vec!["n".to_string()];
        let data = fill_series(vec![row(2, 5), row(4, 7)], &calendar(), None, &measures);
        assert_eq!(data.len(), 3);
        assert_eq!(data[1].ts, day(3));
    }
}
