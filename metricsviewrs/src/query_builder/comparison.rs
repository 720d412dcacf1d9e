//! Base-versus-comparison toplists.
//!
//! Each time range is aggregated in its own grouped subquery; the two are
//! joined on the dimension value and the outer projection adds
//! `<m>__previous`, `<m>__delta_abs` and `<m>__delta_rel` for every compared
//! measure.

use crate::error::{MetricsViewError, Result};
use crate::models::{Sort, SortType};
use crate::queries::ComparisonQuery;
use crate::sql_ast::{Join, OrderItem, SelectItem, SelectQuery, SqlFragment, SqlJoinType, TableRef};
use crate::timeutil;

use super::{AggregateRequest, MetricsViewBuilder};

const BASE: &str = "base";
const COMPARISON: &str = "comparison";

/// SQL plus the column layout of a comparison query.
#[derive(Debug, Clone)]
pub struct ComparisonPlan {
    pub sql: SqlFragment,
    pub dimension: String,
    pub measures: Vec<String>,
    pub compared: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinShape {
    /// Base drives; the limit is applied inside the base subquery.
    BaseLeft,
    /// Comparison drives; the limit is applied inside the comparison subquery.
    ComparisonLeft,
    Full,
}

pub fn previous_alias(measure: &str) -> String {
    format!("{measure}__previous")
}

pub fn delta_abs_alias(measure: &str) -> String {
    format!("{measure}__delta_abs")
}

pub fn delta_rel_alias(measure: &str) -> String {
    format!("{measure}__delta_rel")
}

fn sort_column(sort: &Sort, dimension: &str) -> String {
    if sort.name == dimension {
        return sort.name.clone();
    }
    match sort.sort_type {
        SortType::Base => sort.name.clone(),
        SortType::Comparison => previous_alias(&sort.name),
        SortType::AbsDelta => delta_abs_alias(&sort.name),
        SortType::RelDelta => delta_rel_alias(&sort.name),
    }
}

impl MetricsViewBuilder<'_> {
    pub fn build_comparison(&self, q: &ComparisonQuery) -> Result<ComparisonPlan> {
        if q.measures.is_empty() {
            return Err(MetricsViewError::Validation(
                "comparison requires at least one measure".to_string(),
            ));
        }
        if q.measures.iter().any(|m| m.filter.is_some()) {
            return Err(MetricsViewError::Unsupported(
                "measure filters are not supported in comparison queries".to_string(),
            ));
        }
        let dimension = q.dimension.output_name().to_string();
        let measure_names: Vec<String> = q.measures.iter().map(|m| m.name.clone()).collect();

        let Some(comparison_range) = q.comparison_time_range.as_ref().filter(|r| !r.is_empty()) else {
            if !q.comparison_measures.is_empty() {
                return Err(MetricsViewError::Validation(
                    "comparison measures are provided but comparison time range is not".to_string(),
                ));
            }
            if let Some(s) = q.sort.iter().find(|s| s.sort_type != SortType::Base) {
                return Err(MetricsViewError::Validation(format!(
                    "comparison not enabled for sort measure '{}'",
                    s.name
                )));
            }
            let dims = [q.dimension.clone()];
            let sql = self.build_aggregate(&AggregateRequest {
                dimensions: &dims,
                measures: &q.measures,
                where_clause: q.where_clause.as_ref(),
                having: q.having.as_ref(),
                time_range: q.time_range.as_ref(),
                sort: &q.sort,
                limit: q.limit,
                offset: q.offset,
                paginate: true,
            })?;
            return Ok(ComparisonPlan {
                sql,
                dimension,
                measures: measure_names,
                compared: Vec::new(),
            });
        };

        let base_tz = q.time_range.as_ref().map(|r| r.time_zone.as_str()).unwrap_or("");
        if timeutil::parse_time_zone(base_tz)? != timeutil::parse_time_zone(&comparison_range.time_zone)? {
            return Err(MetricsViewError::Validation(
                "comparison time range must use the same time zone as the base time range".to_string(),
            ));
        }

        let compared: Vec<String> = if q.comparison_measures.is_empty() {
            q.measures
                .iter()
                .filter(|m| m.builtin.is_none())
                .map(|m| m.name.clone())
                .collect()
        } else {
            for name in &q.comparison_measures {
                if !measure_names.contains(name) {
                    return Err(MetricsViewError::Validation(format!(
                        "comparison measure '{name}' is not present in the measures list"
                    )));
                }
            }
            q.comparison_measures.clone()
        };

        let shape = self.comparison_shape(q, &dimension, &measure_names, &compared)?;

        let dim = self.resolve_dimension(&q.dimension)?;
        let dims = std::slice::from_ref(&dim);
        let laterals = self.laterals(dims, q.where_clause.as_ref())?;
        let resolved = q
            .measures
            .iter()
            .map(|m| self.resolve_measure(m))
            .collect::<Result<Vec<_>>>()?;
        let base_pairs: Vec<(String, String)> =
            resolved.iter().map(|m| (m.name.clone(), m.expr.clone())).collect();
        let comparison_pairs: Vec<(String, String)> = resolved
            .iter()
            .filter(|m| compared.contains(&m.name))
            .map(|m| (m.name.clone(), m.expr.clone()))
            .collect();

        let mut base = self.grouped_select(
            dims,
            &base_pairs,
            self.where_clauses(q.time_range.as_ref(), q.where_clause.as_ref())?,
            laterals.clone(),
        )?;
        let mut comparison = self.grouped_select(
            dims,
            &comparison_pairs,
            self.where_clauses(Some(comparison_range), q.where_clause.as_ref())?,
            laterals,
        )?;

        let limit = self.limit(q.limit);
        let offset = q.offset.filter(|o| *o > 0);
        let pushed: Vec<OrderItem> = q
            .sort
            .iter()
            .map(|s| OrderItem {
                expr: self.escape(&s.name),
                desc: s.desc,
            })
            .collect();
        match shape {
            JoinShape::BaseLeft => {
                base.order_by = pushed;
                base.limit = Some(limit);
                base.offset = offset;
            }
            JoinShape::ComparisonLeft => {
                comparison.order_by = pushed;
                comparison.limit = Some(limit);
                comparison.offset = offset;
            }
            JoinShape::Full => {}
        }

        let col = |table: &str, name: &str| format!("{}.{}", self.escape(table), self.escape(name));
        let mut select = vec![SelectItem::raw(
            format!("COALESCE({}, {})", col(BASE, &dimension), col(COMPARISON, &dimension)),
            dimension.clone(),
        )];
        let mut outputs = vec![dimension.clone()];
        for m in &measure_names {
            select.push(SelectItem::raw(col(BASE, m), m.clone()));
            outputs.push(m.clone());
            if !compared.contains(m) {
                continue;
            }
            let current = col(BASE, m);
            let previous = col(COMPARISON, m);
            let delta = format!("{previous} - {current}");
            select.push(SelectItem::raw(previous.clone(), previous_alias(m)));
            select.push(SelectItem::raw(delta.clone(), delta_abs_alias(m)));
            select.push(SelectItem::raw(
                self.dialect().safe_divide(&delta, &current),
                delta_rel_alias(m),
            ));
            outputs.extend([previous_alias(m), delta_abs_alias(m), delta_rel_alias(m)]);
        }

        let on = SqlFragment::raw(
            self.dialect()
                .null_safe_equals(&col(BASE, &dimension), &col(COMPARISON, &dimension)),
        );
        let (from, join) = match shape {
            JoinShape::ComparisonLeft => (
                TableRef::subquery(comparison, COMPARISON),
                Join {
                    join_type: SqlJoinType::Left,
                    table: TableRef::subquery(base, BASE),
                    on,
                },
            ),
            JoinShape::BaseLeft | JoinShape::Full => (
                TableRef::subquery(base, BASE),
                Join {
                    join_type: if shape == JoinShape::Full {
                        SqlJoinType::Full
                    } else {
                        SqlJoinType::Left
                    },
                    table: TableRef::subquery(comparison, COMPARISON),
                    on,
                },
            ),
        };
        let core = SelectQuery {
            select,
            from,
            joins: vec![join],
            ..Default::default()
        };

        let having = q
            .having
            .as_ref()
            .map(|h| self.compile_having(h, &outputs))
            .transpose()?;
        let mut query = self.with_having(core, having);
        let order: Vec<Sort> = q
            .sort
            .iter()
            .map(|s| Sort {
                name: sort_column(s, &dimension),
                desc: s.desc,
                sort_type: SortType::Base,
            })
            .collect();
        query.order_by = self.order_items(&order, &outputs)?;
        query.limit = Some(limit);
        if shape == JoinShape::Full {
            query.offset = offset;
        }

        Ok(ComparisonPlan {
            sql: self.render(&query),
            dimension,
            measures: measure_names,
            compared,
        })
    }

    fn comparison_shape(
        &self,
        q: &ComparisonQuery,
        dimension: &str,
        measures: &[String],
        compared: &[String],
    ) -> Result<JoinShape> {
        let Some(first) = q.sort.first() else {
            return Err(MetricsViewError::Validation("sorting is required".to_string()));
        };
        if q.sort.iter().any(|s| s.sort_type != first.sort_type) {
            return Err(MetricsViewError::Validation(
                "different sort types are not supported in a single query".to_string(),
            ));
        }
        let mut sorts_dimension = false;
        for s in &q.sort {
            if s.name == dimension {
                sorts_dimension = true;
                continue;
            }
            if !measures.contains(&s.name) {
                return Err(MetricsViewError::UnknownReference {
                    kind: "sort field",
                    name: s.name.clone(),
                });
            }
            if s.sort_type != SortType::Base && !compared.contains(&s.name) {
                return Err(MetricsViewError::Validation(format!(
                    "comparison not enabled for sort measure '{}'",
                    s.name
                )));
            }
        }

        let can_push = !q.exact && !sorts_dimension && q.having.is_none();
        let shape = match first.sort_type {
            SortType::Base if can_push => JoinShape::BaseLeft,
            SortType::Comparison if can_push => JoinShape::ComparisonLeft,
            _ => JoinShape::Full,
        };
        if shape == JoinShape::Full && !self.dialect().supports_full_outer_join() {
            return Err(MetricsViewError::unsupported_dialect(
                "comparison without limit push-down",
                self.dialect().name(),
            ));
        }
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DruidDialect;
    use crate::models::{DimensionRequest, MeasureRequest, MetricsViewSpec, TimeRange};
    use crate::queries::ToplistQuery;
    use crate::security::ResolvedSecurity;
    use chrono::{TimeZone, Utc};

    fn view() -> MetricsViewSpec {
        serde_yaml::from_str(
            r#"
name: sales
table: sales
time_dimension: ts
dimensions: [country]
measures:
  - name: revenue
    expression: sum(amount)
  - name: orders
    builtin: {kind: count}
"#,
        )
        .unwrap()
    }

    fn range(month: u32) -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, month + 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn query(sort: Sort) -> ComparisonQuery {
        ComparisonQuery {
            metrics_view: "sales".into(),
            dimension: DimensionRequest::named("country"),
            measures: vec![MeasureRequest::named("revenue")],
            time_range: Some(range(2)),
            comparison_time_range: Some(range(1)),
            sort: vec![sort],
            limit: Some(10),
            ..Default::default()
        }
    }

    #[test]
    fn base_sort_pushes_limit_into_base() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let plan = b.build_comparison(&query(Sort::desc("revenue"))).unwrap();
        assert_eq!(
            plan.sql.sql,
            "SELECT COALESCE(\"base\".\"country\", \"comparison\".\"country\") AS \"country\", \
             \"base\".\"revenue\" AS \"revenue\", \"comparison\".\"revenue\" AS \"revenue__previous\", \
             \"comparison\".\"revenue\" - \"base\".\"revenue\" AS \"revenue__delta_abs\", \
             (\"comparison\".\"revenue\" - \"base\".\"revenue\") / CAST(NULLIF(\"base\".\"revenue\", 0) AS DOUBLE) AS \"revenue__delta_rel\" \
             FROM (SELECT \"country\" AS \"country\", sum(amount) AS \"revenue\" FROM \"sales\" \
             WHERE \"ts\" >= CAST(? AS TIMESTAMP) AND \"ts\" < CAST(? AS TIMESTAMP) GROUP BY 1 \
             ORDER BY \"revenue\" DESC NULLS LAST LIMIT 10) AS \"base\" \
             LEFT OUTER JOIN (SELECT \"country\" AS \"country\", sum(amount) AS \"revenue\" FROM \"sales\" \
             WHERE \"ts\" >= CAST(? AS TIMESTAMP) AND \"ts\" < CAST(? AS TIMESTAMP) GROUP BY 1) AS \"comparison\" \
             ON (((\"base\".\"country\" IS NULL AND \"comparison\".\"country\" IS NULL) OR \"base\".\"country\" = \"comparison\".\"country\")) \
             ORDER BY \"revenue\" DESC NULLS LAST LIMIT 10"
        );
        assert_eq!(plan.sql.args.len(), 4);
        assert_eq!(plan.compared, vec!["revenue".to_string()]);
    }

    #[test]
    fn delta_sort_uses_full_join_without_push_down() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let mut sort = Sort::desc("revenue");
        sort.sort_type = SortType::RelDelta;
        let plan = b.build_comparison(&query(sort.clone())).unwrap();
        assert!(plan.sql.sql.contains("FULL OUTER JOIN"));
        assert!(plan.sql.sql.ends_with("ORDER BY \"revenue__delta_rel\" DESC NULLS LAST LIMIT 10"));
        assert_eq!(plan.sql.sql.matches("LIMIT").count(), 1);

        let druid = MetricsViewBuilder::new(&v, &sec).unwrap().with_dialect(&DruidDialect);
        assert!(matches!(
            druid.build_comparison(&query(sort)),
            Err(MetricsViewError::UnsupportedDialect { .. })
        ));
    }

    #[test]
    fn exact_disables_push_down() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let mut q = query(Sort::desc("revenue"));
        q.exact = true;
        let plan = b.build_comparison(&q).unwrap();
        assert!(plan.sql.sql.contains("FULL OUTER JOIN"));
        assert_eq!(plan.sql.sql.matches("LIMIT").count(), 1);
    }

    #[test]
    fn validation_messages() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();

        let mut q = query(Sort::desc("revenue"));
        q.sort.clear();
        assert_eq!(b.build_comparison(&q).unwrap_err().to_string(), "validation error: sorting is required");

        let mut q = query(Sort::desc("revenue"));
        let mut other = Sort::asc("revenue");
        other.sort_type = SortType::AbsDelta;
        q.sort.push(other);
        assert!(b
            .build_comparison(&q)
            .unwrap_err()
            .to_string()
            .contains("different sort types are not supported in a single query"));

        let mut q = query(Sort::desc("revenue"));
        q.comparison_measures = vec!["profit".into()];
        assert!(b
            .build_comparison(&q)
            .unwrap_err()
            .to_string()
            .contains("comparison measure 'profit' is not present in the measures list"));

        let mut q = query(Sort::desc("revenue"));
        q.comparison_time_range = None;
        q.comparison_measures = vec!["revenue".into()];
        assert!(b
            .build_comparison(&q)
            .unwrap_err()
            .to_string()
            .contains("comparison measures are provided but comparison time range is not"));

        let mut q = query(Sort::desc("orders"));
        q.measures.push(MeasureRequest::named("orders"));
        q.comparison_measures = vec!["revenue".into()];
        q.sort[0].sort_type = SortType::Comparison;
        assert!(b
            .build_comparison(&q)
            .unwrap_err()
            .to_string()
            .contains("comparison not enabled for sort measure 'orders'"));
    }

    #[test]
    fn undeclared_delta_in_having_is_named() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let mut q = query(Sort::desc("revenue"));
        q.comparison_time_range = None;
        q.having = Some(crate::expression::Expression::eq("revenue__delta_abs", 1));
        assert_eq!(
            b.build_comparison(&q).unwrap_err().to_string(),
            "unknown column filter: revenue__delta_abs"
        );
    }

    #[test]
    fn base_only_matches_toplist() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let mut q = query(Sort::desc("revenue"));
        q.comparison_time_range = None;
        let plan = b.build_comparison(&q).unwrap();
        let toplist = b
            .build_toplist(&ToplistQuery {
                metrics_view: "sales".into(),
                dimension: "country".into(),
                measures: q.measures.clone(),
                time_range: q.time_range.clone(),
                sort: q.sort.clone(),
                limit: q.limit,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(plan.sql, toplist);
    }
}
