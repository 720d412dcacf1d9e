//! DuckDB adapter.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

use crate::config::DuckDbConfig;
use crate::dialect::{Dialect, DuckDbDialect};
use crate::error::{MetricsViewError, Result};
use crate::olap::{run_with_timeout, Olap, OlapConnection, RowBatch, RowStream, Statement, STREAM_BUFFER_BATCHES};
use crate::result::{duck_value_to_json, logical_type_from_arrow, ColumnMeta, QueryResult, Schema};

type Pool = Arc<Mutex<Vec<duckdb::Connection>>>;

const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// A DuckDB database shared by pooled connections.
///
/// Connections are cloned from one root handle so in-memory databases are
/// visible to every connection.
#[derive(Clone)]
pub struct DuckDbOlap {
    location: Option<PathBuf>,
    root: Arc<Mutex<duckdb::Connection>>,
    limiter: Arc<Semaphore>,
    max_in_flight: usize,
    pool: Pool,
}

impl DuckDbOlap {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tracing::info!(path = %path.display(), "opening DuckDB database");
        let root = duckdb::Connection::open(&path)?;
        Ok(Self::from_root(Some(path), root))
    }

    pub fn in_memory() -> Result<Self> {
        tracing::debug!("opening in-memory DuckDB database");
        let root = duckdb::Connection::open_in_memory()?;
        Ok(Self::from_root(None, root))
    }

    fn from_root(location: Option<PathBuf>, root: duckdb::Connection) -> Self {
        Self {
            location,
            root: Arc::new(Mutex::new(root)),
            limiter: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENCY)),
            max_in_flight: DEFAULT_MAX_CONCURRENCY,
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configure maximum concurrently checked-out connections.
    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        tracing::debug!(max_concurrency = max_in_flight, "configuring DuckDB concurrency");
        self.max_in_flight = max_in_flight.max(1);
        self.limiter = Arc::new(Semaphore::new(self.max_in_flight));
        self
    }

    /// Apply the `[duckdb]` section of a connector's configuration.
    pub fn with_config(self, config: &DuckDbConfig) -> Self {
        self.with_max_concurrency(config.max_concurrency)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all DuckDB slots in use, waiting for permit");
        }
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MetricsViewError::Execution(format!("limiter closed: {e}")))
    }

    fn checkout_connection(&self) -> Result<duckdb::Connection> {
        {
            let mut guard = self
                .pool
                .lock()
                .map_err(|_| MetricsViewError::Execution("duckdb pool poisoned".to_string()))?;
            if let Some(conn) = guard.pop() {
                tracing::trace!(pool_remaining = guard.len(), "reusing pooled DuckDB connection");
                return Ok(conn);
            }
        }
        let location = self
            .location
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string());
        tracing::debug!(location = %location, "opening new DuckDB connection");
        let root = self
            .root
            .lock()
            .map_err(|_| MetricsViewError::Execution("duckdb root connection poisoned".to_string()))?;
        Ok(root.try_clone()?)
    }

    /// Typed variant of [`Olap::acquire`] for callers that need the appender.
    pub async fn connect(&self, priority: i32) -> Result<DuckDbConnection> {
        let permit = self.acquire_slot().await?;
        let conn = self.checkout_connection()?;
        tracing::trace!(priority, "checked out DuckDB connection");
        Ok(DuckDbConnection {
            conn: Some(Arc::new(Mutex::new(conn))),
            pool: self.pool.clone(),
            _permit: permit,
        })
    }
}

#[async_trait]
impl Olap for DuckDbOlap {
    fn dialect(&self) -> &'static dyn Dialect {
        &DuckDbDialect
    }

    async fn acquire(&self, priority: i32) -> Result<Arc<dyn OlapConnection>> {
        Ok(Arc::new(self.connect(priority).await?))
    }
}

/// One checked-out connection. Returned to the pool when dropped.
pub struct DuckDbConnection {
    conn: Option<Arc<Mutex<duckdb::Connection>>>,
    pool: Pool,
    _permit: OwnedSemaphorePermit,
}

impl DuckDbConnection {
    /// Run `f` against the raw connection on the blocking pool.
    async fn with_raw<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&duckdb::Connection) -> Result<T> + Send + 'static,
    {
        let conn = self
            .conn
            .clone()
            .ok_or_else(|| MetricsViewError::Execution("duckdb connection released".to_string()))?;
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| MetricsViewError::Execution("duckdb connection poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| MetricsViewError::Execution(format!("task join error: {e}")))?
    }

    /// Bulk-load a columnar batch into an existing table.
    pub async fn append_record_batch(
        &self,
        table: &str,
        batch: duckdb::arrow::record_batch::RecordBatch,
    ) -> Result<()> {
        let table = table.to_string();
        self.with_raw(move |conn| {
            let start = Instant::now();
            let rows = batch.num_rows();
            let mut appender = conn.appender(&table)?;
            appender.append_record_batch(batch)?;
            appender.flush()?;
            tracing::debug!(table = %table, rows, ms = start.elapsed().as_millis(), "duckdb append");
            Ok(())
        })
        .await
    }
}

impl Drop for DuckDbConnection {
    fn drop(&mut self) {
        // A cancelled blocking task may still hold the connection; it is
        // closed instead of pooled in that case.
        let Some(Ok(mutex)) = self.conn.take().map(Arc::try_unwrap) else {
            return;
        };
        let Ok(conn) = mutex.into_inner() else {
            return;
        };
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(conn);
        }
    }
}

fn to_duck_value(value: &Value) -> duckdb::types::Value {
    use duckdb::types::Value as DuckValue;
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                DuckValue::BigInt(i)
            } else if let Some(u) = n.as_u64() {
                DuckValue::UBigInt(u)
            } else {
                DuckValue::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => DuckValue::Text(s.clone()),
        other => DuckValue::Text(other.to_string()),
    }
}

fn column_metas(stmt: &duckdb::Statement<'_>) -> Result<Vec<ColumnMeta>> {
    let mut fields = Vec::with_capacity(stmt.column_count());
    for idx in 0..stmt.column_count() {
        let name = stmt
            .column_name(idx)
            .map_err(|e| MetricsViewError::Execution(e.to_string()))?;
        fields.push(ColumnMeta::new(
            name.to_string(),
            logical_type_from_arrow(&stmt.column_type(idx)),
        ));
    }
    Ok(fields)
}

fn row_to_map(row: &duckdb::Row<'_>, fields: &[ColumnMeta]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for (idx, field) in fields.iter().enumerate() {
        map.insert(field.name.clone(), duck_value_to_json(row.get_ref(idx)?.to_owned()));
    }
    Ok(map)
}

/// Send `sql`'s schema, then its rows in batches. Returns early once the
/// receiving side is gone.
fn stream_rows(
    conn: &duckdb::Connection,
    sql: &str,
    args: &[duckdb::types::Value],
    batch_rows: usize,
    schema_tx: &mut Option<oneshot::Sender<Result<Schema>>>,
    tx: &mpsc::Sender<Result<RowBatch>>,
) -> Result<()> {
    let mut prepared = conn.prepare(sql)?;
    let mut rows_iter = prepared.query(duckdb::params_from_iter(args.iter()))?;
    let fields = column_metas(
        rows_iter
            .as_ref()
            .ok_or_else(|| MetricsViewError::Execution("statement missing".to_string()))?,
    )?;
    if let Some(sender) = schema_tx.take() {
        if sender.send(Ok(Schema::new(fields.clone()))).is_err() {
            return Ok(());
        }
    }
    let mut batch = Vec::with_capacity(batch_rows);
    let mut sent = 0usize;
    while let Some(row) = rows_iter.next()? {
        batch.push(row_to_map(row, &fields)?);
        if batch.len() == batch_rows {
            sent += batch.len();
            if tx.blocking_send(Ok(std::mem::take(&mut batch))).is_err() {
                tracing::debug!(rows = sent, "duckdb stream abandoned by consumer");
                return Ok(());
            }
        }
    }
    if !batch.is_empty() {
        sent += batch.len();
        let _ = tx.blocking_send(Ok(batch));
    }
    tracing::debug!(rows = sent, "duckdb stream finished");
    Ok(())
}

#[async_trait]
impl OlapConnection for DuckDbConnection {
    fn dialect(&self) -> &'static dyn Dialect {
        &DuckDbDialect
    }

    async fn execute(&self, stmt: &Statement) -> Result<QueryResult> {
        let sql = stmt.query.clone();
        let args: Vec<duckdb::types::Value> = stmt.args.iter().map(to_duck_value).collect();
        let work = self.with_raw(move |conn| {
            let start = Instant::now();
            let mut prepared = conn.prepare(&sql)?;
            let mut rows_iter = prepared.query(duckdb::params_from_iter(args.iter()))?;
            let fields = column_metas(
                rows_iter
                    .as_ref()
                    .ok_or_else(|| MetricsViewError::Execution("statement missing".to_string()))?,
            )?;
            let mut rows = Vec::new();
            while let Some(row) = rows_iter.next()? {
                rows.push(row_to_map(row, &fields)?);
            }
            tracing::debug!(
                rows = rows.len(),
                columns = fields.len(),
                ms = start.elapsed().as_millis(),
                "duckdb execute"
            );
            Ok(QueryResult::new(Schema::new(fields), rows))
        });
        run_with_timeout(stmt.execution_timeout, work).await
    }

    async fn exec(&self, stmt: &Statement) -> Result<()> {
        let sql = stmt.query.clone();
        let args: Vec<duckdb::types::Value> = stmt.args.iter().map(to_duck_value).collect();
        let work = self.with_raw(move |conn| {
            let start = Instant::now();
            conn.execute(&sql, duckdb::params_from_iter(args.iter()))?;
            tracing::debug!(ms = start.elapsed().as_millis(), "duckdb exec");
            Ok(())
        });
        run_with_timeout(stmt.execution_timeout, work).await
    }

    /// Rows are read on the blocking pool and handed over through a bounded
    /// channel, so at most [`STREAM_BUFFER_BATCHES`] batches are held ahead
    /// of the consumer.
    async fn stream(&self, stmt: &Statement, batch_rows: usize) -> Result<RowStream> {
        let conn = self
            .conn
            .clone()
            .ok_or_else(|| MetricsViewError::Execution("duckdb connection released".to_string()))?;
        let sql = stmt.query.clone();
        let args: Vec<duckdb::types::Value> = stmt.args.iter().map(to_duck_value).collect();
        let batch_rows = batch_rows.max(1);
        let (schema_tx, schema_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_BATCHES);

        tokio::task::spawn_blocking(move || {
            let mut schema_tx = Some(schema_tx);
            let outcome = conn
                .lock()
                .map_err(|_| MetricsViewError::Execution("duckdb connection poisoned".to_string()))
                .and_then(|guard| stream_rows(&guard, &sql, &args, batch_rows, &mut schema_tx, &tx));
            if let Err(err) = outcome {
                match schema_tx.take() {
                    Some(sender) => {
                        let _ = sender.send(Err(err));
                    }
                    None => {
                        let _ = tx.blocking_send(Err(err));
                    }
                }
            }
        });

        let schema = run_with_timeout(stmt.execution_timeout, async {
            schema_rx
                .await
                .map_err(|_| MetricsViewError::Execution("duckdb stream closed before schema".to_string()))?
        })
        .await?;
        Ok(RowStream::new(schema, rx))
    }
}
