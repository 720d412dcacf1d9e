//! Long-to-wide reshaping of aggregation results.
//!
//! Pivoted columns are named `<pivot value>_<measure>`. Engines with a native
//! `PIVOT` run it directly (through a temporary table when they have them);
//! every other engine has its pre-pivot rows copied into a local DuckDB
//! table and pivoted there.

use std::time::Duration;

use serde_json::Value;

use crate::config::PivotConfig;
use crate::dialect::{temp_name, Dialect};
use crate::error::{MetricsViewError, Result};
use crate::models::Sort;
use crate::olap::{with_connection, EnsuredDrop, Olap, Statement};
use crate::result::QueryResult;
use crate::sql_ast::SqlFragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotStrategy {
    /// `PIVOT` over a temporary table holding the pre-pivot rows.
    TempTable,
    /// `PIVOT` over the pre-pivot query as a subquery.
    Native,
    /// Copy the rows into a local engine and pivot there.
    Materialize,
}

impl PivotStrategy {
    pub fn select(dialect: &dyn Dialect) -> Self {
        match (dialect.supports_native_pivot(), dialect.supports_temp_tables()) {
            (true, true) => PivotStrategy::TempTable,
            (true, false) => PivotStrategy::Native,
            _ => PivotStrategy::Materialize,
        }
    }
}

/// Column roles of the pre-pivot result.
#[derive(Debug, Clone, Default)]
pub struct PivotLayout {
    pub on: Vec<String>,
    /// Row dimensions: every dimension not pivoted on.
    pub group_by: Vec<String>,
    pub measures: Vec<String>,
    pub sort: Vec<Sort>,
    pub limit: Option<u64>,
}

impl PivotLayout {
    pub fn new(dimensions: &[String], measures: &[String], on: &[String]) -> Result<Self> {
        if on.is_empty() {
            return Err(MetricsViewError::Validation("pivot requires at least one column".to_string()));
        }
        if let Some(missing) = on.iter().find(|p| !dimensions.contains(p)) {
            return Err(MetricsViewError::Validation(format!(
                "pivot dimension '{missing}' is not in the dimensions list"
            )));
        }
        Ok(Self {
            on: on.to_vec(),
            group_by: dimensions.iter().filter(|d| !on.contains(d)).cloned().collect(),
            measures: measures.to_vec(),
            ..Default::default()
        })
    }

    pub fn with_sort(mut self, sort: &[Sort]) -> Self {
        self.sort = sort.to_vec();
        self
    }

    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit.filter(|l| *l > 0);
        self
    }

    /// Columns of the pre-pivot result.
    pub fn input_columns(&self) -> usize {
        self.on.len() + self.group_by.len() + self.measures.len()
    }
}

/// `PIVOT <source> ON ... USING LAST(m) AS m ... GROUP BY ... ORDER BY ... LIMIT n+1`.
///
/// The extra row lets the caller detect results larger than the limit.
pub fn build_pivot_sql(dialect: &dyn Dialect, source: &str, layout: &PivotLayout) -> Result<String> {
    if !dialect.supports_native_pivot() {
        return Err(MetricsViewError::unsupported_dialect("PIVOT", dialect.name()));
    }
    if layout.measures.is_empty() {
        return Err(MetricsViewError::Validation("pivot requires at least one measure".to_string()));
    }
    let on: Vec<String> = layout.on.iter().map(|c| dialect.escape_identifier(c)).collect();
    let using: Vec<String> = layout
        .measures
        .iter()
        .map(|m| {
            let m = dialect.escape_identifier(m);
            format!("LAST({m}) AS {m}")
        })
        .collect();
    let mut sql = format!("PIVOT {source} ON {} USING {}", on.join(", "), using.join(", "));
    if !layout.group_by.is_empty() {
        let group: Vec<String> = layout.group_by.iter().map(|c| dialect.escape_identifier(c)).collect();
        sql.push_str(&format!(" GROUP BY {}", group.join(", ")));
    }
    if !layout.sort.is_empty() {
        let mut order = Vec::with_capacity(layout.sort.len());
        for s in &layout.sort {
            if !layout.group_by.contains(&s.name) {
                return Err(MetricsViewError::Validation(format!(
                    "pivoted results can only be sorted by row dimensions, not '{}'",
                    s.name
                )));
            }
            order.push(dialect.order_by_expression(&dialect.escape_identifier(&s.name), s.desc));
        }
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }
    if let Some(limit) = layout.limit {
        sql.push_str(&format!(" LIMIT {}", limit + 1));
    }
    Ok(sql)
}

/// Fail when `rows × columns` exceeds `limit`. Zero disables the check.
pub fn check_cell_limit(rows: u64, columns: usize, limit: u64) -> Result<()> {
    let cells = rows.saturating_mul(columns as u64);
    if limit > 0 && cells > limit {
        return Err(MetricsViewError::CapacityExceeded(format!(
            "pivot cell limit exceeded: {rows} rows × {columns} columns > {limit}"
        )));
    }
    Ok(())
}

fn check_row_limit(result: &QueryResult, limit: Option<u64>) -> Result<()> {
    match limit {
        Some(limit) if result.len() as u64 > limit => Err(MetricsViewError::CapacityExceeded(format!(
            "pivot produced more than {limit} rows"
        ))),
        _ => Ok(()),
    }
}

fn first_count(result: &QueryResult) -> Result<u64> {
    result
        .rows
        .first()
        .and_then(|row| row.values().next())
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| MetricsViewError::Execution("row count query returned no count".to_string()))
}

/// Pre-pivot query plus how to reshape it.
#[derive(Debug, Clone)]
pub struct PivotRequest {
    pub sql: SqlFragment,
    pub layout: PivotLayout,
    pub priority: i32,
    pub timeout: Option<Duration>,
}

impl PivotRequest {
    fn statement(&self, sql: String, args: Vec<Value>) -> Statement {
        Statement {
            query: sql,
            args,
            priority: self.priority,
            execution_timeout: self.timeout,
        }
    }
}

pub struct PivotEngine {
    cell_limit: u64,
    append_batch_rows: usize,
    #[cfg(feature = "duckdb")]
    local: Option<crate::backends::DuckDbOlap>,
}

impl PivotEngine {
    pub fn new(config: &PivotConfig) -> Self {
        Self {
            cell_limit: config.cell_limit,
            append_batch_rows: config.append_batch_rows.max(1),
            #[cfg(feature = "duckdb")]
            local: None,
        }
    }

    /// Local engine used by [`PivotStrategy::Materialize`].
    #[cfg(feature = "duckdb")]
    pub fn with_local(mut self, local: crate::backends::DuckDbOlap) -> Self {
        self.local = Some(local);
        self
    }

    pub async fn run(&self, olap: &dyn Olap, req: &PivotRequest) -> Result<QueryResult> {
        self.run_with(PivotStrategy::select(olap.dialect()), olap, req).await
    }

    pub async fn run_with(&self, strategy: PivotStrategy, olap: &dyn Olap, req: &PivotRequest) -> Result<QueryResult> {
        tracing::debug!(?strategy, on = ?req.layout.on, "pivoting result");
        let result = match strategy {
            PivotStrategy::TempTable => self.run_temp_table(olap, req).await?,
            PivotStrategy::Native => self.run_native(olap, req).await?,
            PivotStrategy::Materialize => self.run_materialized(olap, req).await?,
        };
        check_row_limit(&result, req.layout.limit)?;
        Ok(result)
    }

    async fn run_temp_table(&self, olap: &dyn Olap, req: &PivotRequest) -> Result<QueryResult> {
        let conn = olap.acquire(req.priority).await?;
        let dialect = conn.dialect();
        let table = temp_name("__pivot_");
        let escaped = dialect.escape_identifier(&table);
        conn.exec(&req.statement(
            format!("CREATE TEMPORARY TABLE {escaped} AS {}", req.sql.sql),
            req.sql.args.clone(),
        ))
        .await?;
        let guard = EnsuredDrop::new(conn.clone(), table);

        let count = conn
            .execute(&req.statement(format!("SELECT COUNT(*) AS \"count\" FROM {escaped}"), Vec::new()))
            .await?;
        check_cell_limit(first_count(&count)?, req.layout.input_columns(), self.cell_limit)?;

        let pivot = build_pivot_sql(dialect, &escaped, &req.layout)?;
        let result = conn.execute(&req.statement(pivot, Vec::new())).await?;
        guard.finish().await?;
        Ok(result)
    }

    async fn run_native(&self, olap: &dyn Olap, req: &PivotRequest) -> Result<QueryResult> {
        with_connection(olap, req.priority, |conn| async move {
            let count = conn
                .execute(&req.statement(
                    format!("SELECT COUNT(*) AS \"count\" FROM ({}) AS \"pivot_src\"", req.sql.sql),
                    req.sql.args.clone(),
                ))
                .await?;
            check_cell_limit(first_count(&count)?, req.layout.input_columns(), self.cell_limit)?;

            let pivot = build_pivot_sql(conn.dialect(), &format!("({})", req.sql.sql), &req.layout)?;
            conn.execute(&req.statement(pivot, req.sql.args.clone())).await
        })
        .await
    }

    #[cfg(not(feature = "duckdb"))]
    async fn run_materialized(&self, olap: &dyn Olap, _req: &PivotRequest) -> Result<QueryResult> {
        Err(MetricsViewError::unsupported_dialect("pivot", olap.dialect().name()))
    }

    #[cfg(feature = "duckdb")]
    async fn run_materialized(&self, olap: &dyn Olap, req: &PivotRequest) -> Result<QueryResult> {
        use std::sync::Arc;

        use crate::olap::OlapConnection;
        use crate::result::duckdb_type_name;

        let local = self
            .local
            .as_ref()
            .ok_or_else(|| MetricsViewError::unsupported_dialect("pivot", olap.dialect().name()))?;
        let remote = olap.acquire(req.priority).await?;
        let mut source = remote
            .stream(
                &req.statement(req.sql.sql.clone(), req.sql.args.clone()),
                self.append_batch_rows,
            )
            .await?;
        let schema = source.schema().clone();

        let conn = Arc::new(local.connect(req.priority).await?);
        let dialect = conn.dialect();
        let table = temp_name("__pivot_");
        let escaped = dialect.escape_identifier(&table);
        let columns: Vec<String> = schema
            .fields
            .iter()
            .map(|f| format!("{} {}", dialect.escape_identifier(&f.name), duckdb_type_name(f.data_type)))
            .collect();
        conn.exec(&Statement::new(format!("CREATE TABLE {escaped} ({})", columns.join(", "))))
            .await?;
        let guard = EnsuredDrop::new(conn.clone() as Arc<dyn OlapConnection>, table.clone());

        let width = req.layout.input_columns();
        let mut appended: u64 = 0;
        while let Some(chunk) = source.next_batch().await? {
            check_cell_limit(appended + chunk.len() as u64, width, self.cell_limit)?;
            let batch = arrow_batch::to_record_batch(&schema, &chunk)?;
            conn.append_record_batch(&table, batch).await?;
            appended += chunk.len() as u64;
        }
        tracing::debug!(rows = appended, table = %table, "materialized pre-pivot rows");

        let pivot = build_pivot_sql(dialect, &escaped, &req.layout)?;
        let result = conn.execute(&Statement::new(pivot)).await?;
        guard.finish().await?;
        Ok(result)
    }
}

#[cfg(feature = "duckdb")]
mod arrow_batch {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use duckdb::arrow::array::{
        ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
    };
    use duckdb::arrow::datatypes::{DataType, Field, Schema as ArrowSchema, TimeUnit};
    use duckdb::arrow::record_batch::RecordBatch;
    use serde_json::{Map, Value};

    use crate::error::{MetricsViewError, Result};
    use crate::result::{parse_timestamp, LogicalType, Schema};

    fn days_since_epoch(value: &Value) -> Option<i32> {
        let s = value.as_str()?;
        let date = NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()?;
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
        i32::try_from((date - epoch).num_days()).ok()
    }

    fn text(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Columnar copy of `rows` typed by `schema`.
    pub(super) fn to_record_batch(schema: &Schema, rows: &[Map<String, Value>]) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(schema.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.len());
        for meta in &schema.fields {
            let values = rows.iter().map(|r| r.get(&meta.name).unwrap_or(&Value::Null));
            let (data_type, array): (DataType, ArrayRef) = match meta.data_type {
                LogicalType::Boolean => (
                    DataType::Boolean,
                    Arc::new(values.map(Value::as_bool).collect::<BooleanArray>()),
                ),
                LogicalType::Integer => (
                    DataType::Int64,
                    Arc::new(values.map(Value::as_i64).collect::<Int64Array>()),
                ),
                LogicalType::Float | LogicalType::Decimal => (
                    DataType::Float64,
                    Arc::new(values.map(Value::as_f64).collect::<Float64Array>()),
                ),
                LogicalType::Timestamp => (
                    DataType::Timestamp(TimeUnit::Microsecond, None),
                    Arc::new(
                        values
                            .map(|v| parse_timestamp(v).map(|t| t.timestamp_micros()))
                            .collect::<TimestampMicrosecondArray>(),
                    ),
                ),
                LogicalType::Date => (
                    DataType::Date32,
                    Arc::new(values.map(days_since_epoch).collect::<Date32Array>()),
                ),
                _ => (DataType::Utf8, Arc::new(values.map(text).collect::<StringArray>())),
            };
            fields.push(Field::new(&meta.name, data_type, true));
            arrays.push(array);
        }
        RecordBatch::try_new(Arc::new(ArrowSchema::new(fields)), arrays)
            .map_err(|e| MetricsViewError::Execution(format!("build record batch: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{ClickHouseDialect, DruidDialect, DuckDbDialect};

    fn layout() -> PivotLayout {
        PivotLayout::new(
            &["country".to_string(), "year".to_string()],
            &["revenue".to_string()],
            &["year".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn selects_strategy_by_capability() {
        assert_eq!(PivotStrategy::select(&DuckDbDialect), PivotStrategy::TempTable);
        assert_eq!(PivotStrategy::select(&ClickHouseDialect), PivotStrategy::Materialize);
        assert_eq!(PivotStrategy::select(&DruidDialect), PivotStrategy::Materialize);
    }

    #[test]
    fn renders_pivot_statement() {
        let layout = layout().with_sort(&[Sort::desc("country")]).with_limit(Some(10));
        let sql = build_pivot_sql(&DuckDbDialect, "\"tmp\"", &layout).unwrap();
        assert_eq!(
            sql,
            "PIVOT \"tmp\" ON \"year\" USING LAST(\"revenue\") AS \"revenue\" GROUP BY \"country\" \
             ORDER BY \"country\" DESC NULLS LAST LIMIT 11"
        );
        assert!(matches!(
            build_pivot_sql(&DruidDialect, "t", &layout),
            Err(MetricsViewError::UnsupportedDialect { .. })
        ));
    }

    #[test]
    fn rejects_sort_on_pivoted_columns() {
        let layout = layout().with_sort(&[Sort::asc("revenue")]);
        assert!(matches!(
            build_pivot_sql(&DuckDbDialect, "t", &layout),
            Err(MetricsViewError::Validation(_))
        ));
        assert!(PivotLayout::new(&["a".to_string()], &[], &["b".to_string()]).is_err());
    }

    #[test]
    fn cell_limit_boundary() {
        assert!(check_cell_limit(100, 3, 300).is_ok());
        assert!(check_cell_limit(101, 3, 300).is_err());
        assert!(check_cell_limit(u64::MAX, 3, 0).is_ok());
    }
}
