use crate::error::{MetricsViewError, Result};
use crate::sql_ast::{SelectItem, SelectQuery, SqlFragment, TableRef};

use super::MetricsViewBuilder;

impl MetricsViewBuilder<'_> {
    /// Zero-row probe projecting every accessible dimension and measure, used
    /// to read the result types of a view without scanning it.
    pub fn build_schema_probe(&self) -> Result<SqlFragment> {
        let view = self.view();
        let dims = view
            .dimensions
            .iter()
            .filter(|d| self.security.can_access_field(&d.name))
            .map(|d| self.dimension_expr(&d.name))
            .collect::<Result<Vec<_>>>()?;
        let measures = view
            .measures
            .iter()
            .filter(|m| self.security.can_access_field(&m.name))
            .map(|m| self.resolve_measure(&crate::models::MeasureRequest::named(&m.name)))
            .collect::<Result<Vec<_>>>()?;

        if dims.is_empty() && measures.is_empty() {
            return Err(MetricsViewError::Forbidden(format!(
                "no accessible fields in metrics view '{}'",
                view.name
            )));
        }

        let mut select: Vec<SelectItem> = dims
            .iter()
            .map(|d| SelectItem::raw(d.expr.clone(), d.output.clone()))
            .collect();
        select.extend(measures.iter().map(|m| SelectItem::raw(m.expr.clone(), m.name.clone())));

        let query = SelectQuery {
            select,
            from: TableRef::table(self.table()?),
            laterals: self.laterals(&dims, None)?,
            filters: self.where_clauses(None, None)?,
            group_by: if measures.is_empty() { Vec::new() } else { (1..=dims.len()).collect() },
            limit: Some(0),
            ..Default::default()
        };
        Ok(self.render(&query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricsViewSpec;
    use crate::security::ResolvedSecurity;

    #[test]
    fn probe_groups_dimensions_and_returns_no_rows() {
        let v: MetricsViewSpec = serde_yaml::from_str(
            "name: v\ntable: t\ndimensions: [a, b]\nmeasures:\n  - name: n\n    builtin: {kind: count}\n  - name: s\n    expression: sum(x)\n",
        )
        .unwrap();
        let mut sec = ResolvedSecurity::open();
        sec.exclude.insert("b".into());
        let b = MetricsViewBuilder::new(&v, &sec).unwrap();
        let sql = b.build_schema_probe().unwrap();
        assert_eq!(
            sql.sql,
            "SELECT \"a\" AS \"a\", COUNT(*) AS \"n\", sum(x) AS \"s\" FROM \"t\" GROUP BY 1 LIMIT 0"
        );
    }
}
