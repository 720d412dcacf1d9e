//! Apache Druid dialect implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::timeutil::{self, TimeGrain};

use super::{quote_string, trunc_shift, Dialect, DialectKind, ShiftUnit};

#[derive(Debug, Default, Clone, Copy)]
pub struct DruidDialect;

/// ISO-8601 period used by `time_floor`.
fn period(grain: TimeGrain) -> &'static str {
    match grain {
        TimeGrain::Millisecond => "PT0.001S",
        TimeGrain::Second => "PT1S",
        TimeGrain::Minute => "PT1M",
        TimeGrain::Hour => "PT1H",
        TimeGrain::Day => "P1D",
        TimeGrain::Week => "P1W",
        TimeGrain::Month => "P1M",
        TimeGrain::Quarter => "P3M",
        TimeGrain::Year => "P1Y",
        TimeGrain::Unspecified => "",
    }
}

impl Dialect for DruidDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Druid
    }

    fn supports_full_outer_join(&self) -> bool {
        false
    }

    fn supports_ilike(&self) -> bool {
        false
    }

    fn timestamp_placeholder(&self) -> &'static str {
        "TIME_PARSE(?)"
    }

    fn timestamp_arg(&self, t: DateTime<Utc>) -> Value {
        Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    fn unnest_clause(&self, _expr: &str, _table_alias: &str, _column: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn safe_divide(&self, numerator: &str, denominator: &str) -> String {
        format!("SAFE_DIVIDE({numerator}, CAST({denominator} AS DOUBLE))")
    }

    fn time_floor_expression(
        &self,
        expr: &str,
        grain: TimeGrain,
        tz: &str,
        first_day_of_week: u32,
        first_month_of_year: u32,
    ) -> Result<String> {
        self.require_grain(grain)?;
        let spec = quote_string(period(grain));
        let zone = if timeutil::is_utc(tz) {
            quote_string("UTC")
        } else {
            quote_string(tz)
        };
        match trunc_shift(grain, first_day_of_week, first_month_of_year) {
            None => Ok(format!("time_floor({expr}, {spec}, null, {zone})")),
            Some(shift) => {
                let unit = quote_string(match shift.unit {
                    ShiftUnit::Day => "P1D",
                    ShiftUnit::Month => "P1M",
                });
                let n = shift.amount;
                Ok(format!(
                    "time_shift(time_floor(time_shift({expr}, {unit}, {n}, {zone}), {spec}, null, {zone}), {unit}, -{n}, {zone})"
                ))
            }
        }
    }
}
