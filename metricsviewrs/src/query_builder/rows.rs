use crate::error::{MetricsViewError, Result};
use crate::queries::RowsQuery;
use crate::sql_ast::{SelectItem, SelectQuery, SqlFragment, TableRef};
use crate::timeutil::TimeGrain;

use super::MetricsViewBuilder;

impl MetricsViewBuilder<'_> {
    /// Raw rows of the underlying table, projecting only the columns the
    /// caller may see.
    pub fn build_rows(&self, q: &RowsQuery) -> Result<SqlFragment> {
        let view = self.view();
        let mut select = Vec::new();
        let mut outputs = Vec::new();

        if q.time_grain != TimeGrain::Unspecified {
            let time_dim = view
                .time_dimension
                .as_deref()
                .ok_or_else(|| MetricsViewError::MissingTimeDimension(view.name.clone()))?;
            let alias = format!("{time_dim}__{}", q.time_grain.as_str());
            let floor = self.time_floor(&self.time_column()?, q.time_grain, &q.time_zone)?;
            select.push(SelectItem::raw(floor, alias.clone()));
            outputs.push(alias);
        }

        if let Some(time_dim) = view.time_dimension.as_deref().filter(|t| !t.is_empty()) {
            let wanted = q.columns.is_empty() || q.columns.iter().any(|c| c == time_dim);
            if wanted && view.dimension(time_dim).is_none() {
                select.push(SelectItem::raw(self.time_column()?, time_dim));
                outputs.push(time_dim.to_string());
            }
        }

        for name in &q.columns {
            let known = view.dimension(name).is_some() || view.time_dimension.as_deref() == Some(name.as_str());
            if !known || !self.security.can_access_field(name) {
                return Err(MetricsViewError::dimension_not_found(name.clone()));
            }
        }

        for dim in &view.dimensions {
            if !q.columns.is_empty() && !q.columns.contains(&dim.name) {
                continue;
            }
            if !self.security.can_access_field(&dim.name) {
                continue;
            }
            let expr = self.base_dimension_expr(&dim.name, dim.column.as_deref(), dim.expression.as_deref());
            select.push(SelectItem::raw(expr, dim.name.clone()));
            outputs.push(dim.name.clone());
        }

        if select.is_empty() {
            return Err(MetricsViewError::Forbidden(format!(
                "no accessible columns in metrics view '{}'",
                view.name
            )));
        }

        let query = SelectQuery {
            select,
            from: TableRef::table(self.table()?),
            laterals: self.laterals(&[], q.where_clause.as_ref())?,
            filters: self.where_clauses(q.time_range.as_ref(), q.where_clause.as_ref())?,
            order_by: self.order_items(&q.sort, &outputs)?,
            limit: Some(self.limit(q.limit)),
            offset: q.offset.filter(|o| *o > 0),
            ..Default::default()
        };
        Ok(self.render(&query))
    }
}
