//! ClickHouse dialect implementation.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::timeutil::{self, TimeGrain};

use super::{quote_string, trunc_shift, Dialect, DialectKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct ClickHouseDialect;

impl Dialect for ClickHouseDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::ClickHouse
    }

    fn date_trunc_specifier(&self, grain: TimeGrain) -> &'static str {
        match grain {
            TimeGrain::Millisecond => "millisecond",
            TimeGrain::Second => "second",
            TimeGrain::Minute => "minute",
            TimeGrain::Hour => "hour",
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
            TimeGrain::Unspecified => "",
        }
    }

    fn supports_temp_tables(&self) -> bool {
        true
    }

    fn requires_cast_for_like(&self) -> bool {
        true
    }

    fn timestamp_placeholder(&self) -> &'static str {
        "toDateTime64(?, 6, 'UTC')"
    }

    fn timestamp_arg(&self, t: DateTime<Utc>) -> Value {
        Value::String(t.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
    }

    fn unnest_clause(&self, expr: &str, _table_alias: &str, column: &str) -> Result<Option<String>> {
        Ok(Some(format!(" ARRAY JOIN {expr} AS {}", self.escape_identifier(column))))
    }

    fn null_safe_equals(&self, left: &str, right: &str) -> String {
        format!("isNotDistinctFrom({left}, {right})")
    }

    fn cast_to_double(&self, expr: &str) -> String {
        format!("toFloat64({expr})")
    }

    fn cast_to_text(&self, expr: &str) -> String {
        format!("toString({expr})")
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
        let spec = quote_string(self.date_trunc_specifier(grain));
        let (shift_in, shift_out) = match trunc_shift(grain, first_day_of_week, first_month_of_year) {
            Some(s) => (
                format!(" + INTERVAL {} {}", s.amount, s.unit.as_sql()),
                format!(" - INTERVAL {} {}", s.amount, s.unit.as_sql()),
            ),
            None => (String::new(), String::new()),
        };
        let zone = if timeutil::is_utc(tz) {
            quote_string("UTC")
        } else {
            quote_string(tz)
        };
        Ok(format!(
            "date_trunc({spec}, {expr}::DateTime64(6, {zone}){shift_in})::DateTime64(6, {zone}){shift_out}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_specifier_and_zone_cast() {
        let sql = ClickHouseDialect
            .time_floor_expression("ts", TimeGrain::Month, "Europe/Berlin", 1, 1)
            .unwrap();
        assert_eq!(
            sql,
            "date_trunc('month', ts::DateTime64(6, 'Europe/Berlin'))::DateTime64(6, 'Europe/Berlin')"
        );
    }

    #[test]
    fn null_safe_join_uses_native_function() {
        assert_eq!(
            ClickHouseDialect.null_safe_equals("a.x", "b.x"),
            "isNotDistinctFrom(a.x, b.x)"
        );
        assert!(!ClickHouseDialect.supports_native_pivot());
    }
}
