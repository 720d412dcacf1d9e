//! SQL dialect strategies for the supported OLAP engines.
//!
//! Each engine is implemented in its own file. Builders never branch on the
//! engine kind; every identifier, literal, and engine-specific construct goes
//! through a [`Dialect`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MetricsViewError, Result};
use crate::timeutil::{self, TimeGrain};

mod clickhouse;
mod druid;
mod duckdb;
mod pinot;

pub use clickhouse::ClickHouseDialect;
pub use druid::DruidDialect;
pub use duckdb::DuckDbDialect;
pub use pinot::PinotDialect;

/// Supported engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectKind {
    #[default]
    #[serde(rename = "duckdb")]
    DuckDb,
    #[serde(rename = "clickhouse")]
    ClickHouse,
    Druid,
    Pinot,
}

impl DialectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialectKind::DuckDb => "duckdb",
            DialectKind::ClickHouse => "clickhouse",
            DialectKind::Druid => "druid",
            DialectKind::Pinot => "pinot",
        }
    }

    /// The strategy implementing this engine's syntax.
    pub fn strategy(&self) -> &'static dyn Dialect {
        match self {
            DialectKind::DuckDb => &DuckDbDialect,
            DialectKind::ClickHouse => &ClickHouseDialect,
            DialectKind::Druid => &DruidDialect,
            DialectKind::Pinot => &PinotDialect,
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar shift applied around `date_trunc` for custom week/year starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncShift {
    pub amount: u32,
    pub unit: ShiftUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftUnit {
    Day,
    Month,
}

impl ShiftUnit {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ShiftUnit::Day => "DAY",
            ShiftUnit::Month => "MONTH",
        }
    }
}

/// Shift that aligns a custom week or year start with the engine's native
/// boundary, or `None` when the defaults apply.
pub fn trunc_shift(grain: TimeGrain, first_day_of_week: u32, first_month_of_year: u32) -> Option<TruncShift> {
    let fdow = timeutil::clamp_first_day_of_week(first_day_of_week);
    let fmoy = timeutil::clamp_first_month_of_year(first_month_of_year);
    let shift = match grain {
        TimeGrain::Week if fdow > 1 => TruncShift {
            amount: 8 - fdow,
            unit: ShiftUnit::Day,
        },
        TimeGrain::Quarter if (13 - fmoy) % 3 != 0 => TruncShift {
            amount: (13 - fmoy) % 3,
            unit: ShiftUnit::Month,
        },
        TimeGrain::Year if fmoy > 1 => TruncShift {
            amount: 13 - fmoy,
            unit: ShiftUnit::Month,
        },
        _ => return None,
    };
    Some(shift)
}

/// Quote a string for inline use. Only used for engine-controlled tokens
/// (grain names, validated zone names), never for caller values.
pub fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Temporary relation name: prefix plus a random suffix without dashes.
pub fn temp_name(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

/// Dialects render identifiers and engine-specific SQL constructs.
/// Expression tree walking lives in the query builder; the dialect only maps
/// logical constructs to SQL fragments.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn kind(&self) -> DialectKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Wrap an identifier in double quotes, doubling embedded quotes.
    /// Empty names stay empty.
    fn escape_identifier(&self, ident: &str) -> String {
        if ident.is_empty() {
            return String::new();
        }
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Fully qualified table reference.
    fn escape_table(&self, database: Option<&str>, schema: Option<&str>, table: &str) -> String {
        let mut parts = Vec::new();
        for part in [database, schema].into_iter().flatten() {
            if !part.is_empty() {
                parts.push(self.escape_identifier(part));
            }
        }
        parts.push(self.escape_identifier(table));
        parts.join(".")
    }

    /// Engine spelling of a `date_trunc` unit.
    fn date_trunc_specifier(&self, grain: TimeGrain) -> &'static str {
        match grain {
            TimeGrain::Millisecond => "MILLISECOND",
            TimeGrain::Second => "SECOND",
            TimeGrain::Minute => "MINUTE",
            TimeGrain::Hour => "HOUR",
            TimeGrain::Day => "DAY",
            TimeGrain::Week => "WEEK",
            TimeGrain::Month => "MONTH",
            TimeGrain::Quarter => "QUARTER",
            TimeGrain::Year => "YEAR",
            TimeGrain::Unspecified => "",
        }
    }

    /// Explicit null ordering clause, when the engine needs one.
    fn nulls_ordering(&self) -> Option<&'static str> {
        None
    }

    fn order_by_expression(&self, expr: &str, desc: bool) -> String {
        let mut out = expr.to_string();
        if desc {
            out.push_str(" DESC");
        }
        if let Some(nulls) = self.nulls_ordering() {
            out.push(' ');
            out.push_str(nulls);
        }
        out
    }

    fn supports_native_pivot(&self) -> bool {
        false
    }

    fn supports_temp_tables(&self) -> bool {
        false
    }

    fn supports_full_outer_join(&self) -> bool {
        true
    }

    fn supports_ilike(&self) -> bool {
        true
    }

    fn requires_cast_for_like(&self) -> bool {
        false
    }

    /// Placeholder for a timestamp argument, and the value bound to it.
    fn timestamp_placeholder(&self) -> &'static str {
        "?"
    }

    fn timestamp_arg(&self, t: DateTime<Utc>) -> Value {
        Value::String(t.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
    }

    /// Null-safe equality used to join grouped subqueries on dimensions.
    fn null_safe_equals(&self, left: &str, right: &str) -> String {
        format!("(({left} IS NULL AND {right} IS NULL) OR {left} = {right})")
    }

    fn safe_divide(&self, numerator: &str, denominator: &str) -> String {
        format!("({numerator}) / CAST(NULLIF({denominator}, 0) AS DOUBLE)")
    }

    fn cast_to_double(&self, expr: &str) -> String {
        format!("CAST({expr} AS DOUBLE)")
    }

    fn cast_to_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS VARCHAR)")
    }

    /// Expression that truncates `expr` to `grain` in zone `tz`.
    ///
    /// `tz` must already be a validated IANA name (or empty for UTC).
    fn time_floor_expression(
        &self,
        expr: &str,
        grain: TimeGrain,
        tz: &str,
        first_day_of_week: u32,
        first_month_of_year: u32,
    ) -> Result<String>;

    /// Clause appended after the FROM item that flattens an array dimension
    /// into `column`. `None` means the engine flattens multi-value columns
    /// on its own.
    fn unnest_clause(&self, _expr: &str, _table_alias: &str, _column: &str) -> Result<Option<String>> {
        Err(MetricsViewError::unsupported_dialect("unnested dimensions", self.name()))
    }

    /// Fail unless `grain` names a real unit.
    fn require_grain(&self, grain: TimeGrain) -> Result<()> {
        if grain == TimeGrain::Unspecified {
            return Err(MetricsViewError::Validation(
                "a time grain is required to floor timestamps".to_string(),
            ));
        }
        Ok(())
    }
}
