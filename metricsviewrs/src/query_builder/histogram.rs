//! Statistics and binning SQL for numeric column histograms.

use serde_json::Value;

use crate::dialect::{Dialect, DialectKind};
use crate::error::{MetricsViewError, Result};
use crate::sql_ast::SqlFragment;

fn require_histogram_dialect(dialect: &dyn Dialect) -> Result<()> {
    match dialect.kind() {
        DialectKind::DuckDb | DialectKind::ClickHouse => Ok(()),
        _ => Err(MetricsViewError::unsupported_dialect("numeric histogram", dialect.name())),
    }
}

/// `iqr`, approximate distinct `count` and `range` of a column.
pub fn histogram_stats_sql(dialect: &dyn Dialect, table: &str, column: &str) -> Result<SqlFragment> {
    require_histogram_dialect(dialect)?;
    let c = dialect.escape_identifier(column);
    let sql = match dialect.kind() {
        DialectKind::ClickHouse => format!(
            "SELECT (quantileTDigest(0.75)({c}) - quantileTDigest(0.25)({c}))::DOUBLE AS iqr, \
             uniq({c}) AS count, (max({c}) - min({c}))::DOUBLE AS range FROM {table}"
        ),
        _ => format!(
            "SELECT (approx_quantile({c}, 0.75) - approx_quantile({c}, 0.25))::DOUBLE AS iqr, \
             approx_count_distinct({c}) AS count, (max({c}) - min({c}))::DOUBLE AS range FROM {table}"
        ),
    };
    Ok(SqlFragment::raw(sql))
}

/// `min`, `max` and `range` of a column as doubles.
pub fn histogram_minmax_sql(dialect: &dyn Dialect, table: &str, column: &str) -> Result<SqlFragment> {
    require_histogram_dialect(dialect)?;
    let c = dialect.escape_identifier(column);
    Ok(SqlFragment::raw(format!(
        "SELECT min({c})::DOUBLE AS min, max({c})::DOUBLE AS max, (max({c}) - min({c}))::DOUBLE AS range FROM {table}"
    )))
}

/// Count non-null values into `buckets` equal-width bins starting at `low`.
///
/// Values at or beyond the last edge land in the last bin.
pub fn histogram_bucket_sql(
    dialect: &dyn Dialect,
    table: &str,
    column: &str,
    buckets: u64,
    low: f64,
    width: f64,
) -> Result<SqlFragment> {
    require_histogram_dialect(dialect)?;
    if buckets == 0 || !(width > 0.0) || !low.is_finite() {
        return Err(MetricsViewError::Validation(format!(
            "invalid histogram layout: {buckets} buckets of width {width}"
        )));
    }
    let c = dialect.escape_identifier(column);
    let last = buckets - 1;
    let (series, idx) = match dialect.kind() {
        DialectKind::ClickHouse => (format!("numbers({buckets})"), "number"),
        _ => (format!("range(0, {buckets}, 1)"), "range"),
    };
    let num = "CAST(? AS DOUBLE)";
    let sql = format!(
        "WITH data_table AS (SELECT {c}::DOUBLE AS value FROM {table} WHERE {c} IS NOT NULL), \
         buckets AS (SELECT {idx}::DOUBLE AS bucket, {num} + {idx} * {num} AS low, {num} + ({idx} + 1) * {num} AS high FROM {series}), \
         binned AS (SELECT LEAST(GREATEST(FLOOR((value - {num}) / {num}), 0), {last})::DOUBLE AS bucket FROM data_table), \
         counts AS (SELECT bucket, COUNT(*) AS count FROM binned GROUP BY bucket) \
         SELECT buckets.bucket AS bucket, buckets.low AS low, buckets.high AS high, COALESCE(counts.count, 0) AS count \
         FROM buckets LEFT JOIN counts ON buckets.bucket = counts.bucket ORDER BY buckets.bucket"
    );
    let args = [low, width, low, width, low, width]
        .into_iter()
        .map(Value::from)
        .collect();
    Ok(SqlFragment::new(sql, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{ClickHouseDialect, DuckDbDialect, PinotDialect};

    #[test]
    fn bucket_sql_binds_layout() {
        let sql = histogram_bucket_sql(&DuckDbDialect, "\"t\"", "x", 4, 0.0, 2.5).unwrap();
        assert!(sql.sql.contains("FROM range(0, 4, 1)"));
        assert!(sql.sql.contains("GREATEST(FLOOR((value - CAST(? AS DOUBLE)) / CAST(? AS DOUBLE)), 0), 3)"));
        assert_eq!(sql.args.len(), 6);
        assert_eq!(sql.args[1], Value::from(2.5));

        let ch = histogram_bucket_sql(&ClickHouseDialect, "\"t\"", "x", 4, 0.0, 2.5).unwrap();
        assert!(ch.sql.contains("FROM numbers(4)"));
    }

    #[test]
    fn rejects_degenerate_layout_and_dialects() {
        assert!(histogram_bucket_sql(&DuckDbDialect, "\"t\"", "x", 0, 0.0, 1.0).is_err());
        assert!(histogram_bucket_sql(&DuckDbDialect, "\"t\"", "x", 3, 0.0, 0.0).is_err());
        assert!(matches!(
            histogram_stats_sql(&PinotDialect, "\"t\"", "x"),
            Err(MetricsViewError::UnsupportedDialect { .. })
        ));
    }
}
