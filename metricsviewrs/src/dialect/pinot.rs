//! Apache Pinot dialect implementation.

use crate::error::{MetricsViewError, Result};
use crate::timeutil::{self, TimeGrain};

use super::{quote_string, trunc_shift, Dialect, DialectKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct PinotDialect;

impl Dialect for PinotDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Pinot
    }

    fn supports_full_outer_join(&self) -> bool {
        false
    }

    fn supports_ilike(&self) -> bool {
        false
    }

    fn timestamp_placeholder(&self) -> &'static str {
        "CAST(? AS TIMESTAMP)"
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
        if trunc_shift(grain, first_day_of_week, first_month_of_year).is_some() {
            return Err(MetricsViewError::unsupported_dialect(
                "custom first day of week or month of year",
                self.name(),
            ));
        }
        let spec = quote_string(self.date_trunc_specifier(grain));
        if timeutil::is_utc(tz) {
            Ok(format!("date_trunc({spec}, {expr}, 'MILLISECONDS')"))
        } else {
            Ok(format!(
                "date_trunc({spec}, {expr}, 'MILLISECONDS', {})",
                quote_string(tz)
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_in_milliseconds() {
        let sql = PinotDialect
            .time_floor_expression("ts", TimeGrain::Day, "Asia/Tokyo", 1, 1)
            .unwrap();
        assert_eq!(sql, "date_trunc('DAY', ts, 'MILLISECONDS', 'Asia/Tokyo')");
    }

    #[test]
    fn custom_calendar_unsupported() {
        let err = PinotDialect
            .time_floor_expression("ts", TimeGrain::Week, "", 3, 1)
            .unwrap_err();
        assert!(matches!(err, MetricsViewError::UnsupportedDialect { .. }));
    }
}
