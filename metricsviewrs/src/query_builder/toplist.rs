use crate::error::{MetricsViewError, Result};
use crate::models::{DimensionRequest, Sort};
use crate::queries::ToplistQuery;
use crate::sql_ast::SqlFragment;

use super::{AggregateRequest, MetricsViewBuilder};

impl MetricsViewBuilder<'_> {
    /// Rank values of one dimension. Without an explicit sort the first
    /// measure is ranked descending.
    pub fn build_toplist(&self, q: &ToplistQuery) -> Result<SqlFragment> {
        if q.dimension.is_empty() {
            return Err(MetricsViewError::Validation(
                "toplist requires a dimension".to_string(),
            ));
        }
        let Some(first) = q.measures.first() else {
            return Err(MetricsViewError::Validation(
                "toplist requires at least one measure".to_string(),
            ));
        };
        let dims = [DimensionRequest::named(q.dimension.clone())];
        let default_sort = [Sort::desc(first.name.clone())];
        let sort: &[Sort] = if q.sort.is_empty() { &default_sort } else { &q.sort };

        self.build_aggregate(&AggregateRequest {
            dimensions: &dims,
            measures: &q.measures,
            where_clause: q.where_clause.as_ref(),
            having: q.having.as_ref(),
            time_range: q.time_range.as_ref(),
            sort,
            limit: q.limit,
            offset: q.offset,
            paginate: true,
        })
    }
}
