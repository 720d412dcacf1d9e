use crate::error::{MetricsViewError, Result};
use crate::queries::TotalsQuery;
use crate::sql_ast::SqlFragment;

use super::{AggregateRequest, MetricsViewBuilder};

impl MetricsViewBuilder<'_> {
    /// One row of measures over the filtered view.
    pub fn build_totals(&self, q: &TotalsQuery) -> Result<SqlFragment> {
        if q.measures.is_empty() {
            return Err(MetricsViewError::Validation(
                "totals requires at least one measure".to_string(),
            ));
        }
        if q.measures.iter().any(|m| m.filter.is_some()) {
            return Err(MetricsViewError::Unsupported(
                "measure filters are not supported in totals queries".to_string(),
            ));
        }
        self.build_aggregate(&AggregateRequest {
            measures: &q.measures,
            where_clause: q.where_clause.as_ref(),
            time_range: q.time_range.as_ref(),
            paginate: false,
            ..Default::default()
        })
    }
}
