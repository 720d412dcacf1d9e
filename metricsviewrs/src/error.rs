use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetricsViewError>;

#[derive(Debug, Error)]
pub enum MetricsViewError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("{query} is not supported for dialect {dialect}")]
    UnsupportedDialect { query: String, dialect: String },
    #[error("metrics view '{0}' does not have a time dimension")]
    MissingTimeDimension(String),
    #[error("{kind} not found: {name}")]
    UnknownReference { kind: &'static str, name: String },
    #[error("unknown column filter: {0}")]
    UnknownColumnFilter(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("export error: {0}")]
    Export(String),
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MetricsViewError {
    pub(crate) fn dimension_not_found(name: impl Into<String>) -> Self {
        Self::UnknownReference {
            kind: "dimension",
            name: name.into(),
        }
    }

    pub(crate) fn measure_not_found(name: impl Into<String>) -> Self {
        Self::UnknownReference {
            kind: "measure",
            name: name.into(),
        }
    }

    pub(crate) fn unsupported_dialect(query: &str, dialect: &str) -> Self {
        Self::UnsupportedDialect {
            query: query.to_string(),
            dialect: dialect.to_string(),
        }
    }
}
