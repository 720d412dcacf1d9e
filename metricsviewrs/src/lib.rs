pub mod backends;
pub mod bucketing;
pub mod config;
pub mod dialect;
pub mod error;
pub mod export;
pub mod expression;
pub mod logging;
pub mod models;
pub mod olap;
pub mod pivot;
pub mod queries;
pub mod query_builder;
pub mod registry;
pub mod result;
pub mod runtime;
pub mod security;
pub mod sql_ast;
pub mod timeutil;

pub use backends::ConnectorManager;
#[cfg(feature = "duckdb")]
pub use backends::DuckDbOlap;
pub use config::EngineConfig;
pub use dialect::{Dialect, DialectKind};
pub use error::{MetricsViewError, Result};
pub use expression::Expression;
pub use models::{DimensionRequest, MeasureRequest, MetricsViewSpec, Sort, TimeRange};
pub use olap::{Olap, OlapConnection, Statement};
pub use queries::{
    AggregationQuery, CacheableQuery, ColumnTimeseriesQuery, ComparisonQuery, NumericHistogramQuery, RowsQuery,
    SchemaQuery, SearchQuery, TimeseriesQuery, ToplistQuery, TotalsQuery,
};
pub use query_builder::MetricsViewBuilder;
pub use registry::MetricsViewRegistry;
pub use result::{ColumnMeta, LogicalType, QueryResult, Schema};
pub use runtime::Runtime;
pub use security::{ResolvedSecurity, SecurityClaims, SecurityResolver};
pub use timeutil::TimeGrain;
