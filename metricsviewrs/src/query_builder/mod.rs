//! SQL builders for metrics-view queries.
//!
//! [`MetricsViewBuilder`] owns name resolution against a view, security
//! enforcement and the clauses every query shape shares (time range, row
//! filters, ordering, limits). The per-shape builders live in the submodules.

use crate::dialect::Dialect;
use crate::error::{MetricsViewError, Result};
use crate::expression::Expression;
use crate::models::{BuiltinMeasure, DimensionRequest, MeasureRequest, MetricsViewSpec, Sort, TimeRange};
use crate::security::ResolvedSecurity;
use crate::sql_ast::{OrderItem, SelectItem, SelectQuery, SqlFragment, SqlRenderer, TableRef};
use crate::timeutil::{self, TimeGrain};

mod aggregation;
mod comparison;
pub mod filters;
mod histogram;
mod rows;
mod schema;
mod search;
mod timeseries;
mod toplist;
mod totals;

pub use aggregation::AggregateRequest;
pub use comparison::{delta_abs_alias, delta_rel_alias, previous_alias, ComparisonPlan};
pub use filters::{AliasResolver, ColumnResolver, ExpressionCompiler};
pub use histogram::{histogram_bucket_sql, histogram_minmax_sql, histogram_stats_sql};
pub use search::{SEARCH_DIMENSION_COLUMN, SEARCH_VALUE_COLUMN};
pub use timeseries::{column_timeseries_sql, spine_sql, ColumnSeriesSql, SPINE_COLUMN};

use filters::like_predicate;

/// Default row limit when a request leaves it unset or zero.
pub const DEFAULT_LIMIT: u64 = 100;

/// A dimension resolved to the SQL projected for it.
#[derive(Debug, Clone)]
pub struct ResolvedDimension {
    pub name: String,
    pub output: String,
    pub expr: String,
    /// Clause flattening an array dimension, when the dialect needs one.
    pub lateral: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedMeasure {
    pub name: String,
    pub expr: String,
    pub filter: Option<Expression>,
}

pub struct MetricsViewBuilder<'a> {
    view: &'a MetricsViewSpec,
    dialect: &'a dyn Dialect,
    security: &'a ResolvedSecurity,
    default_limit: u64,
}

impl<'a> MetricsViewBuilder<'a> {
    /// Fails with `Forbidden` when the policy hides the whole view.
    pub fn new(view: &'a MetricsViewSpec, security: &'a ResolvedSecurity) -> Result<Self> {
        if security.blocks_all() {
            return Err(MetricsViewError::Forbidden(format!(
                "access to metrics view '{}' is denied",
                view.name
            )));
        }
        Ok(Self {
            view,
            dialect: view.dialect.strategy(),
            security,
            default_limit: DEFAULT_LIMIT,
        })
    }

    pub fn with_dialect(mut self, dialect: &'a dyn Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_default_limit(mut self, limit: u64) -> Self {
        if limit > 0 {
            self.default_limit = limit;
        }
        self
    }

    pub fn dialect(&self) -> &'a dyn Dialect {
        self.dialect
    }

    pub fn view(&self) -> &'a MetricsViewSpec {
        self.view
    }

    pub fn render(&self, query: &SelectQuery) -> SqlFragment {
        SqlRenderer::new(self.dialect).render_select(query)
    }

    pub fn escape(&self, name: &str) -> String {
        self.dialect.escape_identifier(name)
    }

    // === Resolution ===

    pub fn table(&self) -> Result<String> {
        let relation = self.view.relation().ok_or_else(|| {
            MetricsViewError::Validation(format!(
                "metrics view '{}' has no table or model",
                self.view.name
            ))
        })?;
        if self.view.model.as_deref().is_some_and(|m| !m.is_empty()) {
            return Ok(self.escape(relation));
        }
        Ok(self.dialect.escape_table(
            self.view.database.as_deref(),
            self.view.database_schema.as_deref(),
            relation,
        ))
    }

    /// Escaped time column. Fails when the view has none.
    pub fn time_column(&self) -> Result<String> {
        let name = self
            .view
            .time_dimension
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MetricsViewError::MissingTimeDimension(self.view.name.clone()))?;
        match self.view.dimension(name) {
            Some(dim) => Ok(self.base_dimension_expr(dim.name.as_str(), dim.column.as_deref(), dim.expression.as_deref())),
            None => Ok(self.escape(name)),
        }
    }

    fn is_time_dimension(&self, name: &str) -> bool {
        self.view.time_dimension.as_deref() == Some(name)
    }

    fn base_dimension_expr(&self, name: &str, column: Option<&str>, expression: Option<&str>) -> String {
        match (expression.filter(|e| !e.is_empty()), column.filter(|c| !c.is_empty())) {
            (Some(expr), _) => format!("({expr})"),
            (None, Some(col)) => self.escape(col),
            (None, None) => self.escape(name),
        }
    }

    /// SQL for a dimension name as it appears in filters and projections.
    pub fn dimension_expr(&self, name: &str) -> Result<ResolvedDimension> {
        // The time dimension stays queryable when `include`/`exclude` rules
        // leave it out; only a blocked policy hides it.
        if self.is_time_dimension(name) && self.view.dimension(name).is_none() {
            return Ok(ResolvedDimension {
                name: name.to_string(),
                output: name.to_string(),
                expr: self.time_column()?,
                lateral: None,
            });
        }
        let dim = self
            .view
            .dimension(name)
            .filter(|_| self.security.can_access_field(name) || self.is_time_dimension(name))
            .ok_or_else(|| MetricsViewError::dimension_not_found(name))?;
        let expr = self.base_dimension_expr(&dim.name, dim.column.as_deref(), dim.expression.as_deref());
        if !dim.unnest {
            return Ok(ResolvedDimension {
                name: dim.name.clone(),
                output: dim.name.clone(),
                expr,
                lateral: None,
            });
        }
        let column = format!("{}__unnest", dim.name);
        let table = format!("{}__tbl", dim.name);
        match self.dialect.unnest_clause(&expr, &table, &column)? {
            Some(lateral) => Ok(ResolvedDimension {
                name: dim.name.clone(),
                output: dim.name.clone(),
                expr: self.escape(&column),
                lateral: Some(lateral),
            }),
            None => Ok(ResolvedDimension {
                name: dim.name.clone(),
                output: dim.name.clone(),
                expr,
                lateral: None,
            }),
        }
    }

    /// Resolve a requested dimension, applying its time grain if any.
    pub fn resolve_dimension(&self, req: &DimensionRequest) -> Result<ResolvedDimension> {
        let mut dim = self.dimension_expr(&req.name)?;
        dim.output = req.output_name().to_string();
        if req.time_grain != TimeGrain::Unspecified {
            dim.expr = self.time_floor(&dim.expr, req.time_grain, &req.time_zone)?;
        }
        Ok(dim)
    }

    /// Floor `expr` to `grain` in zone `tz` using the view's calendar.
    pub fn time_floor(&self, expr: &str, grain: TimeGrain, tz: &str) -> Result<String> {
        timeutil::parse_time_zone(tz)?;
        let tz = if timeutil::is_utc(tz) { "" } else { tz };
        self.dialect.time_floor_expression(
            expr,
            grain,
            tz,
            self.view.first_day_of_week,
            self.view.first_month_of_year,
        )
    }

    pub fn resolve_measure(&self, req: &MeasureRequest) -> Result<ResolvedMeasure> {
        let builtin = match &req.builtin {
            Some(b) => Some(b.clone()),
            None => {
                let spec = self
                    .view
                    .measure(&req.name)
                    .filter(|_| self.security.can_access_field(&req.name))
                    .ok_or_else(|| MetricsViewError::measure_not_found(&req.name))?;
                match (&spec.builtin, spec.expression.as_deref().filter(|e| !e.is_empty())) {
                    (Some(b), _) => Some(b.clone()),
                    (None, Some(expr)) => {
                        return Ok(ResolvedMeasure {
                            name: req.name.clone(),
                            expr: expr.to_string(),
                            filter: req.filter.clone(),
                        })
                    }
                    (None, None) => {
                        return Err(MetricsViewError::Validation(format!(
                            "measure '{}' has neither an expression nor a builtin kind",
                            req.name
                        )))
                    }
                }
            }
        };
        let expr = match builtin {
            Some(BuiltinMeasure::CountDistinct { dimension }) => {
                let dim = self.dimension_expr(&dimension)?;
                format!("COUNT(DISTINCT {})", dim.expr)
            }
            _ => "COUNT(*)".to_string(),
        };
        Ok(ResolvedMeasure {
            name: req.name.clone(),
            expr,
            filter: req.filter.clone(),
        })
    }

    // === Clauses ===

    /// `col >= ? AND col < ?` for the set bounds of `range`.
    pub fn time_range_filter(&self, range: Option<&TimeRange>) -> Result<Option<SqlFragment>> {
        let Some(range) = range.filter(|r| !r.is_empty()) else {
            return Ok(None);
        };
        timeutil::parse_time_zone(&range.time_zone)?;
        let col = self.time_column()?;
        let placeholder = self.dialect.timestamp_placeholder();
        let mut parts = Vec::new();
        let mut args = Vec::new();
        if let Some(start) = range.start {
            parts.push(format!("{col} >= {placeholder}"));
            args.push(self.dialect.timestamp_arg(start));
        }
        if let Some(end) = range.end {
            parts.push(format!("{col} < {placeholder}"));
            args.push(self.dialect.timestamp_arg(end));
        }
        Ok(Some(SqlFragment::new(parts.join(" AND "), args)))
    }

    pub fn compile_where(&self, expr: &Expression) -> Result<SqlFragment> {
        let resolver = DimensionResolver { builder: self };
        ExpressionCompiler::new(self.dialect, &resolver).compile(expr)
    }

    /// Time range, compiled `where` and the row filter, in that order.
    pub fn where_clauses(
        &self,
        time_range: Option<&TimeRange>,
        where_clause: Option<&Expression>,
    ) -> Result<Vec<SqlFragment>> {
        let mut clauses = Vec::new();
        if let Some(range) = self.time_range_filter(time_range)? {
            clauses.push(range);
        }
        if let Some(expr) = where_clause {
            clauses.push(self.compile_where(expr)?);
        }
        if let Some(row_filter) = self.security.row_filter.as_deref() {
            clauses.push(SqlFragment::raw(row_filter));
        }
        Ok(clauses)
    }

    /// Compile `having` against the output columns of a query.
    pub fn compile_having(&self, expr: &Expression, outputs: &[String]) -> Result<SqlFragment> {
        let resolver = AliasResolver::new(self.dialect, outputs.iter().cloned());
        ExpressionCompiler::new(self.dialect, &resolver).compile(expr)
    }

    /// Lateral clauses for unnested dimensions used by projections or filters.
    pub fn laterals(&self, dims: &[ResolvedDimension], where_clause: Option<&Expression>) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        let referenced = where_clause.map(|w| w.identifiers()).unwrap_or_default();
        for name in referenced {
            if dims.iter().any(|d| d.name == name) {
                continue;
            }
            if let Some(lateral) = self.dimension_expr(name)?.lateral {
                if !out.contains(&lateral) {
                    out.push(lateral);
                }
            }
        }
        for lateral in dims.iter().filter_map(|d| d.lateral.clone()) {
            if !out.contains(&lateral) {
                out.push(lateral);
            }
        }
        Ok(out)
    }

    /// `SELECT dims, measures FROM view WHERE ... GROUP BY <dim ordinals>`.
    pub fn grouped_select(
        &self,
        dims: &[ResolvedDimension],
        measures: &[(String, String)],
        filters: Vec<SqlFragment>,
        laterals: Vec<String>,
    ) -> Result<SelectQuery> {
        let mut select: Vec<SelectItem> = dims
            .iter()
            .map(|d| SelectItem::raw(d.expr.clone(), d.output.clone()))
            .collect();
        select.extend(measures.iter().map(|(name, expr)| SelectItem::raw(expr.clone(), name.clone())));
        Ok(SelectQuery {
            select,
            from: TableRef::table(self.table()?),
            laterals,
            filters,
            group_by: (1..=dims.len()).collect(),
            ..Default::default()
        })
    }

    pub fn order_items(&self, sort: &[Sort], outputs: &[String]) -> Result<Vec<OrderItem>> {
        sort.iter()
            .map(|s| {
                if !outputs.iter().any(|o| o == &s.name) {
                    return Err(MetricsViewError::UnknownReference {
                        kind: "sort field",
                        name: s.name.clone(),
                    });
                }
                Ok(OrderItem {
                    expr: self.escape(&s.name),
                    desc: s.desc,
                })
            })
            .collect()
    }

    pub fn limit(&self, requested: Option<u64>) -> u64 {
        requested.filter(|l| *l > 0).unwrap_or(self.default_limit)
    }

    /// Apply `having` over the finished projection so it can name output aliases.
    pub fn with_having(&self, query: SelectQuery, having: Option<SqlFragment>) -> SelectQuery {
        match having {
            Some(filter) => {
                let mut outer = query.wrap("having_wrap");
                outer.filters.push(filter);
                outer
            }
            None => query,
        }
    }

    /// `lhs ILIKE ?` with the dialect's case-insensitive fallback.
    pub fn like(&self, lhs: &str) -> String {
        like_predicate(self.dialect, lhs, "?", false)
    }
}

/// Resolves `where` identifiers to dimension expressions.
struct DimensionResolver<'b, 'a> {
    builder: &'b MetricsViewBuilder<'a>,
}

impl ColumnResolver for DimensionResolver<'_, '_> {
    fn resolve(&self, name: &str) -> Result<String> {
        if filters::COMPARISON_SUFFIXES.iter().any(|s| name.ends_with(s))
            && self.builder.view.dimension(name).is_none()
        {
            return Err(MetricsViewError::UnknownColumnFilter(name.to_string()));
        }
        Ok(self.builder.dimension_expr(name)?.expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DruidDialect;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn view() -> MetricsViewSpec {
        serde_yaml::from_str(
            r#"
name: ad_bids
database_schema: main
table: ad_bids
time_dimension: timestamp
dimensions:
  - publisher
  - name: domain
    expression: lower(domain)
  - name: tags
    column: tags
    unnest: true
measures:
  - name: total
    builtin: {kind: count}
  - name: avg_bid
    expression: avg(bid_price)
"#,
        )
        .unwrap()
    }

    #[test]
    fn resolves_names() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        assert_eq!(b.table().unwrap(), "\"ad_bids\"");
        assert_eq!(b.dimension_expr("domain").unwrap().expr, "(lower(domain))");
        assert_eq!(b.dimension_expr("timestamp").unwrap().expr, "\"timestamp\"");
        let tags = b.dimension_expr("tags").unwrap();
        assert_eq!(tags.expr, "\"tags__unnest\"");
        assert_eq!(
            tags.lateral.as_deref(),
            Some(", LATERAL UNNEST(\"tags\") AS \"tags__tbl\"(\"tags__unnest\")")
        );
        assert_eq!(b.resolve_measure(&MeasureRequest::named("total")).unwrap().expr, "COUNT(*)");
        assert!(matches!(
            b.resolve_measure(&MeasureRequest::named("nope")),
            Err(MetricsViewError::UnknownReference { kind: "measure", .. })
        ));
    }

    #[test]
    fn time_range_uses_placeholders() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap().with_dialect(&DruidDialect);
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2022, 2, 1, 0, 0, 0).unwrap(),
        );
        let f = b.time_range_filter(Some(&range)).unwrap().unwrap();
        assert_eq!(
            f.sql,
            "\"timestamp\" >= TIME_PARSE(?) AND \"timestamp\" < TIME_PARSE(?)"
        );
        assert_eq!(
            f.args,
            vec![json!("2022-01-01T00:00:00.000Z"), json!("2022-02-01T00:00:00.000Z")]
        );
        assert_eq!(b.table().unwrap(), "\"main\".\"ad_bids\"");
    }

    #[test]
    fn missing_time_dimension_is_named() {
        let mut v = view();
        v.time_dimension = None;
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let err = b
            .time_range_filter(Some(&TimeRange::new(Utc::now(), Utc::now())))
            .unwrap_err();
        assert_eq!(err.to_string(), "metrics view 'ad_bids' does not have a time dimension");
    }

    #[test]
    fn security_hides_fields_and_adds_row_filter() {
        let v = view();
        let mut sec = ResolvedSecurity::open();
        sec.exclude.insert("domain".to_string());
        sec.row_filter = Some("publisher <> 'x'".to_string());
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        assert!(matches!(
            b.dimension_expr("domain"),
            Err(MetricsViewError::UnknownReference { .. })
        ));
        let clauses = b.where_clauses(None, Some(&Expression::eq("publisher", "A"))).unwrap();
        assert_eq!(clauses[0].sql, "\"publisher\" = ?");
        assert_eq!(clauses[1].sql, "publisher <> 'x'");
    }

    #[test]
    fn excluded_time_dimension_stays_queryable() {
        let mut v = view();
        let mut sec = ResolvedSecurity::open();
        sec.exclude.insert("timestamp".to_string());
        sec.exclude.insert("publisher".to_string());
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        assert_eq!(b.dimension_expr("timestamp").unwrap().expr, "\"timestamp\"");
        assert!(b.dimension_expr("publisher").is_err());

        // also when the view lists it as a regular dimension
        v.dimensions.push(crate::models::DimensionSpec {
            name: "timestamp".into(),
            column: Some("timestamp".into()),
            ..Default::default()
        });
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        assert_eq!(b.dimension_expr("timestamp").unwrap().expr, "\"timestamp\"");

        let mut only = ResolvedSecurity::open();
        only.include.insert("domain".to_string());
        let b = MetricsViewBuilder::new(&v, &only).unwrap();
        assert!(b.dimension_expr("timestamp").is_ok());
    }

    #[test]
    fn blocked_policy_is_forbidden() {
        let v = view();
        let sec = ResolvedSecurity::denied();
        assert!(matches!(
            MetricsViewBuilder::new(&v, &sec),
            Err(MetricsViewError::Forbidden(_))
        ));
    }

    #[test]
    fn zoned_grain_validates_zone() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let mut req = DimensionRequest::with_grain("timestamp", TimeGrain::Day);
        req.time_zone = "Mars/Olympus".to_string();
        assert!(matches!(b.resolve_dimension(&req), Err(MetricsViewError::Validation(_))));
    }
}
