//! DuckDB dialect implementation.

use crate::error::Result;
use crate::timeutil::{self, TimeGrain};

use super::{quote_string, trunc_shift, Dialect, DialectKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDialect;

impl Dialect for DuckDbDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::DuckDb
    }

    /// Metrics views read models from the default catalog, so only the
    /// table name is emitted.
    fn escape_table(&self, _database: Option<&str>, _schema: Option<&str>, table: &str) -> String {
        self.escape_identifier(table)
    }

    fn nulls_ordering(&self) -> Option<&'static str> {
        Some("NULLS LAST")
    }

    fn supports_native_pivot(&self) -> bool {
        true
    }

    fn supports_temp_tables(&self) -> bool {
        true
    }

    fn timestamp_placeholder(&self) -> &'static str {
        "CAST(? AS TIMESTAMP)"
    }

    fn unnest_clause(&self, expr: &str, table_alias: &str, column: &str) -> Result<Option<String>> {
        Ok(Some(format!(
            ", LATERAL UNNEST({expr}) AS {}({})",
            self.escape_identifier(table_alias),
            self.escape_identifier(column)
        )))
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
        let shift = trunc_shift(grain, first_day_of_week, first_month_of_year);
        let (shift_in, shift_out) = match shift {
            Some(s) => (
                format!(" + INTERVAL {} {}", s.amount, s.unit.as_sql()),
                format!(" - INTERVAL {} {}", s.amount, s.unit.as_sql()),
            ),
            None => (String::new(), String::new()),
        };

        if timeutil::is_utc(tz) {
            return Ok(format!(
                "date_trunc({spec}, {expr}::TIMESTAMP{shift_in})::TIMESTAMP{shift_out}"
            ));
        }

        let zone = quote_string(tz);
        if grain.is_calendar() {
            // Truncate on the local wall clock, then convert back to UTC.
            Ok(format!(
                "timezone({zone}, date_trunc({spec}, timezone({zone}, {expr}::TIMESTAMPTZ){shift_in}){shift_out})::TIMESTAMP"
            ))
        } else {
            Ok(format!(
                "time_bucket(INTERVAL {}, {expr}::TIMESTAMPTZ, {zone})",
                quote_string(&format!("1 {}", self.date_trunc_specifier(grain)))
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_fast_path() {
        let sql = DuckDbDialect
            .time_floor_expression("\"ts\"", TimeGrain::Day, "UTC", 1, 1)
            .unwrap();
        assert_eq!(sql, "date_trunc('DAY', \"ts\"::TIMESTAMP)::TIMESTAMP");
    }

    #[test]
    fn shifted_week() {
        let sql = DuckDbDialect
            .time_floor_expression("\"ts\"", TimeGrain::Week, "", 7, 1)
            .unwrap();
        assert_eq!(
            sql,
            "date_trunc('WEEK', \"ts\"::TIMESTAMP + INTERVAL 1 DAY)::TIMESTAMP - INTERVAL 1 DAY"
        );
    }

    #[test]
    fn zoned_calendar_and_sub_day() {
        let day = DuckDbDialect
            .time_floor_expression("\"ts\"", TimeGrain::Day, "Asia/Kathmandu", 1, 1)
            .unwrap();
        assert_eq!(
            day,
            "timezone('Asia/Kathmandu', date_trunc('DAY', timezone('Asia/Kathmandu', \"ts\"::TIMESTAMPTZ)))::TIMESTAMP"
        );
        let hour = DuckDbDialect
            .time_floor_expression("\"ts\"", TimeGrain::Hour, "Asia/Kathmandu", 1, 1)
            .unwrap();
        assert_eq!(
            hour,
            "time_bucket(INTERVAL '1 HOUR', \"ts\"::TIMESTAMPTZ, 'Asia/Kathmandu')"
        );
    }

    #[test]
    fn orders_nulls_last() {
        assert_eq!(
            DuckDbDialect.order_by_expression("\"m\"", true),
            "\"m\" DESC NULLS LAST"
        );
        assert_eq!(DuckDbDialect.escape_table(Some("db"), Some("s"), "t"), "\"t\"");
    }

    #[test]
    fn rejects_unspecified_grain() {
        assert!(DuckDbDialect
            .time_floor_expression("\"ts\"", TimeGrain::Unspecified, "", 1, 1)
            .is_err());
    }
}
