use serde_json::Value;

use crate::error::{MetricsViewError, Result};
use crate::queries::SearchQuery;
use crate::sql_ast::{SelectItem, SelectQuery, SqlFragment, TableRef};

use super::MetricsViewBuilder;

/// Output columns of a search.
pub const SEARCH_DIMENSION_COLUMN: &str = "dimension";
pub const SEARCH_VALUE_COLUMN: &str = "value";

impl MetricsViewBuilder<'_> {
    /// Distinct `(dimension, value)` pairs whose text matches `%search%`,
    /// one branch per searchable dimension joined with UNION ALL.
    pub fn build_search(&self, q: &SearchQuery) -> Result<SqlFragment> {
        let view = self.view();
        let names: Vec<String> = if q.dimensions.is_empty() {
            view.dimensions
                .iter()
                .filter(|d| self.security.can_access_field(&d.name))
                .map(|d| d.name.clone())
                .collect()
        } else {
            q.dimensions.clone()
        };
        if names.is_empty() {
            return Err(MetricsViewError::Validation(format!(
                "metrics view '{}' has no searchable dimensions",
                view.name
            )));
        }

        let dialect = self.dialect();
        let pattern = Value::String(format!("%{}%", q.search));
        let mut branches = Vec::with_capacity(names.len());
        for name in &names {
            let dim = self.dimension_expr(name)?;
            let text = dialect.cast_to_text(&dim.expr);
            let mut filters = self.where_clauses(q.time_range.as_ref(), q.where_clause.as_ref())?;
            filters.push(SqlFragment::new(self.like(&text), vec![pattern.clone()]));
            let branch = SelectQuery {
                distinct: true,
                select: vec![
                    SelectItem::new(
                        SqlFragment::new(dialect.cast_to_text("?"), vec![Value::String(dim.name.clone())]),
                        SEARCH_DIMENSION_COLUMN,
                    ),
                    SelectItem::raw(text, SEARCH_VALUE_COLUMN),
                ],
                from: TableRef::table(self.table()?),
                laterals: self.laterals(std::slice::from_ref(&dim), q.where_clause.as_ref())?,
                filters,
                ..Default::default()
            };
            branches.push(self.render(&branch));
        }

        let mut args = Vec::new();
        let union: Vec<String> = branches
            .into_iter()
            .map(|b| {
                args.extend(b.args);
                b.sql
            })
            .collect();
        let order: Vec<String> = [SEARCH_DIMENSION_COLUMN, SEARCH_VALUE_COLUMN]
            .iter()
            .map(|c| dialect.order_by_expression(&self.escape(c), false))
            .collect();
        let sql = format!(
            "SELECT * FROM ({}) AS {} ORDER BY {} LIMIT {}",
            union.join(" UNION ALL "),
            self.escape("search"),
            order.join(", "),
            self.limit(q.limit)
        );
        Ok(SqlFragment::new(sql, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DruidDialect;
    use crate::expression::Expression;
    use crate::models::MetricsViewSpec;
    use crate::security::ResolvedSecurity;
    use serde_json::json;

    fn view() -> MetricsViewSpec {
        serde_yaml::from_str("name: v\ntable: t\ndimensions: [publisher, domain]\n").unwrap()
    }

    #[test]
    fn unions_one_branch_per_dimension() {
        let v = view();
        let sec = ResolvedSecurity::open();
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let q = SearchQuery {
            metrics_view: "v".into(),
            search: "goo".into(),
            where_clause: Some(Expression::eq("publisher", "Google")),
            limit: Some(5),
            ..Default::default()
        };
        let sql = b.build_search(&q).unwrap();
        assert_eq!(
            sql.sql,
            "SELECT * FROM (\
             SELECT DISTINCT CAST(? AS VARCHAR) AS \"dimension\", CAST(\"publisher\" AS VARCHAR) AS \"value\" FROM \"t\" \
             WHERE (\"publisher\" = ?) AND (CAST(\"publisher\" AS VARCHAR) ILIKE ?) \
             UNION ALL \
             SELECT DISTINCT CAST(? AS VARCHAR) AS \"dimension\", CAST(\"domain\" AS VARCHAR) AS \"value\" FROM \"t\" \
             WHERE (\"publisher\" = ?) AND (CAST(\"domain\" AS VARCHAR) ILIKE ?)\
             ) AS \"search\" ORDER BY \"dimension\" NULLS LAST, \"value\" NULLS LAST LIMIT 5"
        );
        assert_eq!(
            sql.args,
            vec![
                json!("publisher"),
                json!("Google"),
                json!("%goo%"),
                json!("domain"),
                json!("Google"),
                json!("%goo%"),
            ]
        );
    }

    #[test]
    fn falls_back_to_lower_like_and_hides_excluded() {
        let v = view();
        let mut sec = ResolvedSecurity::open();
        sec.exclude.insert("domain".into());
        let b = MetricsViewBuilder::new(&v, &sec).unwrap().with_dialect(&DruidDialect);
        let q = SearchQuery {
            metrics_view: "v".into(),
            search: "x".into(),
            ..Default::default()
        };
        let sql = b.build_search(&q).unwrap();
        assert!(sql.sql.contains("LOWER(CAST(\"publisher\" AS VARCHAR)) LIKE LOWER(?)"));
        assert!(!sql.sql.contains("domain"));

        let q = SearchQuery {
            dimensions: vec!["domain".into()],
            ..q
        };
        assert!(matches!(b.build_search(&q), Err(MetricsViewError::UnknownReference { .. })));
    }
}
