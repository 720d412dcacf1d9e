use crate::error::{MetricsViewError, Result};
use crate::expression::Expression;
use crate::models::{DimensionRequest, MeasureRequest, Sort, TimeRange};
use crate::queries::AggregationQuery;
use crate::sql_ast::{Join, SelectItem, SelectQuery, SqlFragment, SqlJoinType, TableRef};

use super::{MetricsViewBuilder, ResolvedDimension, ResolvedMeasure};

/// Shared inputs of every grouped query shape.
#[derive(Debug, Clone, Default)]
pub struct AggregateRequest<'q> {
    pub dimensions: &'q [DimensionRequest],
    pub measures: &'q [MeasureRequest],
    pub where_clause: Option<&'q Expression>,
    pub having: Option<&'q Expression>,
    pub time_range: Option<&'q TimeRange>,
    pub sort: &'q [Sort],
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Apply ORDER BY / LIMIT / OFFSET. Off for totals and pre-pivot queries.
    pub paginate: bool,
}

impl MetricsViewBuilder<'_> {
    pub fn build_aggregation(&self, q: &AggregationQuery) -> Result<SqlFragment> {
        let pivoting = !q.pivot_on.is_empty();
        if pivoting {
            if q.offset.is_some_and(|o| o > 0) {
                return Err(MetricsViewError::Unsupported(
                    "offset is not supported with pivot".to_string(),
                ));
            }
            for name in &q.pivot_on {
                if !q.dimensions.iter().any(|d| d.output_name() == name) {
                    return Err(MetricsViewError::Validation(format!(
                        "pivot dimension '{name}' is not in the dimensions list"
                    )));
                }
            }
        }
        self.build_aggregate(&AggregateRequest {
            dimensions: &q.dimensions,
            measures: &q.measures,
            where_clause: q.where_clause.as_ref(),
            having: q.having.as_ref(),
            time_range: q.time_range.as_ref(),
            sort: &q.sort,
            limit: q.limit,
            offset: q.offset,
            paginate: !pivoting,
        })
    }

    pub fn build_aggregate(&self, req: &AggregateRequest<'_>) -> Result<SqlFragment> {
        Ok(self.render(&self.aggregate_query(req)?))
    }

    pub(crate) fn aggregate_query(&self, req: &AggregateRequest<'_>) -> Result<SelectQuery> {
        if req.dimensions.is_empty() && req.measures.is_empty() {
            return Err(MetricsViewError::Validation(
                "at least one dimension or measure is required".to_string(),
            ));
        }
        let dims = req
            .dimensions
            .iter()
            .map(|d| self.resolve_dimension(d))
            .collect::<Result<Vec<_>>>()?;
        let measures = req
            .measures
            .iter()
            .map(|m| self.resolve_measure(m))
            .collect::<Result<Vec<_>>>()?;

        let filtered: Vec<&ResolvedMeasure> = measures.iter().filter(|m| m.filter.is_some()).collect();
        if filtered.len() > 1 {
            return Err(MetricsViewError::Unsupported(
                "only one measure filter is supported per query".to_string(),
            ));
        }

        let mut outputs: Vec<String> = dims.iter().map(|d| d.output.clone()).collect();
        outputs.extend(measures.iter().map(|m| m.name.clone()));

        let filters = self.where_clauses(req.time_range, req.where_clause)?;
        let core = match filtered.first() {
            None => {
                let laterals = self.laterals(&dims, req.where_clause)?;
                let pairs: Vec<(String, String)> =
                    measures.iter().map(|m| (m.name.clone(), m.expr.clone())).collect();
                self.grouped_select(&dims, &pairs, filters, laterals)?
            }
            Some(fm) => self.filtered_measure_join(&dims, &measures, fm, filters, req.where_clause)?,
        };

        let having = req
            .having
            .map(|h| self.compile_having(h, &outputs))
            .transpose()?;
        let mut query = self.with_having(core, having);
        if req.paginate {
            query.order_by = self.order_items(req.sort, &outputs)?;
            query.limit = Some(self.limit(req.limit));
            query.offset = req.offset.filter(|o| *o > 0);
        }
        Ok(query)
    }

    /// Two grouped subqueries, one also restricted by the measure's filter,
    /// joined on the dimension tuple with a null-safe predicate.
    fn filtered_measure_join(
        &self,
        dims: &[ResolvedDimension],
        measures: &[ResolvedMeasure],
        filtered: &ResolvedMeasure,
        filters: Vec<SqlFragment>,
        where_clause: Option<&Expression>,
    ) -> Result<SelectQuery> {
        let Some(measure_filter) = filtered.filter.as_ref() else {
            return Err(MetricsViewError::Validation(format!(
                "measure '{}' has no filter",
                filtered.name
            )));
        };
        let filter_sql = self.compile_where(measure_filter)?;
        let combined = Expression::and_opt(where_clause.cloned(), Some(measure_filter.clone()));
        // Only the filtered side may unnest what the measure filter references.
        let base_laterals = self.laterals(dims, where_clause)?;
        let filt_laterals = self.laterals(dims, combined.as_ref())?;

        let plain: Vec<(String, String)> = measures
            .iter()
            .filter(|m| m.filter.is_none())
            .map(|m| (m.name.clone(), m.expr.clone()))
            .collect();
        let only = vec![(filtered.name.clone(), filtered.expr.clone())];

        let mut filt_filters = filters.clone();
        filt_filters.push(filter_sql);

        if dims.is_empty() && plain.is_empty() {
            return self.grouped_select(dims, &only, filt_filters, filt_laterals);
        }

        let base = self.grouped_select(dims, &plain, filters, base_laterals)?;
        let filt = self.grouped_select(dims, &only, filt_filters, filt_laterals)?;

        let side = |table: &str, col: &str| format!("{}.{}", self.escape(table), self.escape(col));
        let mut select: Vec<SelectItem> = dims
            .iter()
            .map(|d| SelectItem::raw(side("base", &d.output), d.output.clone()))
            .collect();
        for m in measures {
            let table = if m.filter.is_some() { "filt" } else { "base" };
            select.push(SelectItem::raw(side(table, &m.name), m.name.clone()));
        }

        let on: Vec<String> = dims
            .iter()
            .map(|d| {
                self.dialect()
                    .null_safe_equals(&side("base", &d.output), &side("filt", &d.output))
            })
            .collect();
        let on = if on.is_empty() {
            "TRUE".to_string()
        } else {
            on.join(" AND ")
        };

        Ok(SelectQuery {
            select,
            from: TableRef::subquery(base, "base"),
            joins: vec![Join {
                join_type: SqlJoinType::Left,
                table: TableRef::subquery(filt, "filt"),
                on: SqlFragment::raw(on),
            }],
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricsViewSpec;
    use crate::security::ResolvedSecurity;
    use crate::timeutil::TimeGrain;
    use serde_json::json;

    fn view() -> MetricsViewSpec {
        serde_yaml::from_str(
            r#"
name: ad_bids
table: ad_bids
time_dimension: timestamp
dimensions: [publisher, domain]
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
    fn groups_by_ordinal_with_default_limit() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let q = AggregationQuery {
            metrics_view: "ad_bids".into(),
            dimensions: vec![
                DimensionRequest::named("publisher"),
                DimensionRequest::with_grain("timestamp", TimeGrain::Month),
            ],
            measures: vec![MeasureRequest::named("total")],
            where_clause: Some(Expression::in_list("publisher", vec![json!("A"), json!(null)])),
            sort: vec![Sort::desc("total")],
            ..Default::default()
        };
        let sql = b.build_aggregation(&q).unwrap();
        assert_eq!(
            sql.sql,
            "SELECT \"publisher\" AS \"publisher\", date_trunc('MONTH', \"timestamp\"::TIMESTAMP)::TIMESTAMP AS \"timestamp\", \
             COUNT(*) AS \"total\" FROM \"ad_bids\" WHERE (\"publisher\" IN (?) OR \"publisher\" IS NULL) \
             GROUP BY 1, 2 ORDER BY \"total\" DESC NULLS LAST LIMIT 100"
        );
        assert_eq!(sql.args, vec![json!("A")]);
    }

    #[test]
    fn single_measure_filter_joins_null_safely() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let q = AggregationQuery {
            metrics_view: "ad_bids".into(),
            dimensions: vec![DimensionRequest::named("publisher")],
            measures: vec![
                MeasureRequest::named("total"),
                MeasureRequest {
                    name: "avg_bid".into(),
                    filter: Some(Expression::eq("domain", "g.com")),
                    ..Default::default()
                },
            ],
            limit: Some(5),
            ..Default::default()
        };
        let sql = b.build_aggregation(&q).unwrap();
        assert_eq!(
            sql.sql,
            "SELECT \"base\".\"publisher\" AS \"publisher\", \"base\".\"total\" AS \"total\", \"filt\".\"avg_bid\" AS \"avg_bid\" \
             FROM (SELECT \"publisher\" AS \"publisher\", COUNT(*) AS \"total\" FROM \"ad_bids\" GROUP BY 1) AS \"base\" \
             LEFT OUTER JOIN (SELECT \"publisher\" AS \"publisher\", avg(bid_price) AS \"avg_bid\" FROM \"ad_bids\" \
             WHERE \"domain\" = ? GROUP BY 1) AS \"filt\" \
             ON (((\"base\".\"publisher\" IS NULL AND \"filt\".\"publisher\" IS NULL) OR \"base\".\"publisher\" = \"filt\".\"publisher\")) \
             LIMIT 5"
        );
        assert_eq!(sql.args, vec![json!("g.com")]);
    }

    #[test]
    fn measure_filter_unnest_stays_on_the_filtered_side() {
        let v: MetricsViewSpec = serde_yaml::from_str(
            r#"
name: ad_bids
table: ad_bids
dimensions:
  - publisher
  - name: tags
    column: tags
    unnest: true
measures:
  - name: total
    builtin: {kind: count}
  - name: tagged
    builtin: {kind: count}
"#,
        )
        .unwrap();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let q = AggregationQuery {
            metrics_view: "ad_bids".into(),
            dimensions: vec![DimensionRequest::named("publisher")],
            measures: vec![
                MeasureRequest::named("total"),
                MeasureRequest {
                    name: "tagged".into(),
                    filter: Some(Expression::eq("tags", "sports")),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let sql = b.build_aggregation(&q).unwrap().sql;
        let (base, filt) = sql.split_once("LEFT OUTER JOIN").unwrap();
        assert!(!base.contains("UNNEST"), "{base}");
        assert!(filt.contains("LATERAL UNNEST(\"tags\") AS \"tags__tbl\"(\"tags__unnest\")"), "{filt}");
        assert!(filt.contains("WHERE \"tags__unnest\" = ?"), "{filt}");
    }

    #[test]
    fn rejects_two_measure_filters() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let filtered = |name: &str| MeasureRequest {
            name: name.into(),
            filter: Some(Expression::eq("domain", "x")),
            ..Default::default()
        };
        let q = AggregationQuery {
            metrics_view: "ad_bids".into(),
            measures: vec![filtered("total"), filtered("avg_bid")],
            ..Default::default()
        };
        assert!(matches!(b.build_aggregation(&q), Err(MetricsViewError::Unsupported(_))));
    }

    #[test]
    fn having_wraps_projection() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let q = AggregationQuery {
            metrics_view: "ad_bids".into(),
            dimensions: vec![DimensionRequest::named("domain")],
            measures: vec![MeasureRequest::named("total")],
            having: Some(Expression::cond(
                crate::expression::Operator::Gt,
                vec![Expression::ident("total"), Expression::value(10)],
            )),
            offset: Some(20),
            ..Default::default()
        };
        let sql = b.build_aggregation(&q).unwrap();
        assert_eq!(
            sql.sql,
            "SELECT * FROM (SELECT \"domain\" AS \"domain\", COUNT(*) AS \"total\" FROM \"ad_bids\" GROUP BY 1) AS \"having_wrap\" \
             WHERE \"total\" > ? LIMIT 100 OFFSET 20"
        );
    }

    #[test]
    fn pivot_rejects_offset_and_skips_pagination() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let mut q = AggregationQuery {
            metrics_view: "ad_bids".into(),
            dimensions: vec![DimensionRequest::named("publisher"), DimensionRequest::named("domain")],
            measures: vec![MeasureRequest::named("total")],
            pivot_on: vec!["publisher".into()],
            sort: vec![Sort::asc("domain")],
            ..Default::default()
        };
        let sql = b.build_aggregation(&q).unwrap();
        assert!(!sql.sql.contains("LIMIT"));
        q.offset = Some(1);
        assert!(matches!(b.build_aggregation(&q), Err(MetricsViewError::Unsupported(_))));
    }

    #[test]
    fn unknown_sort_field() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let q = AggregationQuery {
            metrics_view: "ad_bids".into(),
            measures: vec![MeasureRequest::named("total")],
            sort: vec![Sort::asc("publisher")],
            ..Default::default()
        };
        let err = b.build_aggregation(&q).unwrap_err();
        assert_eq!(err.to_string(), "sort field not found: publisher");
    }
}
