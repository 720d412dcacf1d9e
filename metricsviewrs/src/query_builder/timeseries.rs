use chrono::{DateTime, Utc};

use crate::dialect::Dialect;
use crate::error::{MetricsViewError, Result};
use crate::models::{DimensionRequest, Sort};
use crate::queries::TimeseriesQuery;
use crate::sql_ast::{Join, SelectItem, SelectQuery, SqlFragment, SqlJoinType, SqlRenderer, TableRef};
use crate::timeutil::TimeGrain;

use super::{AggregateRequest, MetricsViewBuilder};

/// Output column holding the bucket timestamp.
pub const SPINE_COLUMN: &str = "ts";

impl MetricsViewBuilder<'_> {
    /// Measures per time bucket, ascending. Gaps are filled by the caller.
    pub fn build_timeseries(&self, q: &TimeseriesQuery) -> Result<SqlFragment> {
        if q.time_grain == TimeGrain::Unspecified {
            return Err(MetricsViewError::Validation(
                "time series requires a time grain".to_string(),
            ));
        }
        let time_dim = self
            .view()
            .time_dimension
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MetricsViewError::MissingTimeDimension(self.view().name.clone()))?;
        let dims = [DimensionRequest {
            name: time_dim,
            time_grain: q.time_grain,
            time_zone: q.time_zone.clone(),
            alias: Some(SPINE_COLUMN.to_string()),
        }];
        let mut query = self.aggregate_query(&AggregateRequest {
            dimensions: &dims,
            measures: &q.measures,
            where_clause: q.where_clause.as_ref(),
            having: q.having.as_ref(),
            time_range: q.time_range.as_ref(),
            paginate: false,
            ..Default::default()
        })?;
        let mut outputs = vec![SPINE_COLUMN.to_string()];
        outputs.extend(q.measures.iter().map(|m| m.name.clone()));
        query.order_by = self.order_items(&[Sort::asc(SPINE_COLUMN)], &outputs)?;
        Ok(self.render(&query))
    }
}

/// `CREATE TEMPORARY TABLE <name>` holding one row per spine timestamp.
pub fn spine_sql(dialect: &dyn Dialect, table: &str, points: &[DateTime<Utc>]) -> Result<SqlFragment> {
    if !dialect.supports_temp_tables() {
        return Err(MetricsViewError::unsupported_dialect("time spine", dialect.name()));
    }
    if points.is_empty() {
        return Err(MetricsViewError::Validation("time spine is empty".to_string()));
    }
    let placeholder = dialect.timestamp_placeholder();
    let rows: Vec<String> = points.iter().map(|_| format!("({placeholder})")).collect();
    let col = dialect.escape_identifier(SPINE_COLUMN);
    Ok(SqlFragment::new(
        format!(
            "CREATE TEMPORARY TABLE {} AS SELECT v.{col} AS {col} FROM (VALUES {}) AS v({col})",
            dialect.escape_identifier(table),
            rows.join(", ")
        ),
        points.iter().map(|t| dialect.timestamp_arg(*t)).collect(),
    ))
}

/// Inputs of a spine-joined series over a raw table column.
#[derive(Debug, Clone)]
pub struct ColumnSeriesSql<'a> {
    pub spine_table: &'a str,
    /// Escaped source relation.
    pub table: &'a str,
    pub timestamp_column: &'a str,
    /// `(alias, aggregate expression)` pairs.
    pub measures: &'a [(String, String)],
    pub grain: TimeGrain,
    pub time_zone: &'a str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Aggregates per bucket left-joined onto the spine, with gaps filled by zero.
pub fn column_timeseries_sql(dialect: &dyn Dialect, p: &ColumnSeriesSql<'_>) -> Result<SqlFragment> {
    let ts = dialect.escape_identifier(p.timestamp_column);
    let floor = dialect.time_floor_expression(&ts, p.grain, p.time_zone, 1, 1)?;
    let placeholder = dialect.timestamp_placeholder();

    let mut inner_select = vec![SelectItem::raw(floor, SPINE_COLUMN)];
    inner_select.extend(p.measures.iter().map(|(alias, expr)| SelectItem::raw(expr.clone(), alias.clone())));
    let inner = SelectQuery {
        select: inner_select,
        from: TableRef::table(p.table),
        filters: vec![SqlFragment::new(
            format!("{ts} >= {placeholder} AND {ts} < {placeholder}"),
            vec![dialect.timestamp_arg(p.start), dialect.timestamp_arg(p.end)],
        )],
        group_by: vec![1],
        ..Default::default()
    };

    let col = |table: &str, name: &str| {
        format!("{}.{}", dialect.escape_identifier(table), dialect.escape_identifier(name))
    };
    let mut select = vec![SelectItem::raw(col("spine", SPINE_COLUMN), SPINE_COLUMN)];
    select.extend(
        p.measures
            .iter()
            .map(|(alias, _)| SelectItem::raw(format!("COALESCE({}, 0)", col("agg", alias)), alias.clone())),
    );
    let outer = SelectQuery {
        select,
        from: TableRef {
            alias: Some("spine".to_string()),
            ..TableRef::table(dialect.escape_identifier(p.spine_table))
        },
        joins: vec![Join {
            join_type: SqlJoinType::Left,
            table: TableRef::subquery(inner, "agg"),
            on: SqlFragment::raw(format!("{} = {}", col("spine", SPINE_COLUMN), col("agg", SPINE_COLUMN))),
        }],
        order_by: vec![crate::sql_ast::OrderItem {
            expr: dialect.escape_identifier(SPINE_COLUMN),
            desc: false,
        }],
        ..Default::default()
    };
    Ok(SqlRenderer::new(dialect).render_select(&outer))
}
