//! Execution boundary between query resolution and an OLAP engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::dialect::Dialect;
use crate::error::{MetricsViewError, Result};
use crate::result::{QueryResult, Schema};
use crate::sql_ast::SqlFragment;

/// A SQL statement with its positional arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    pub query: String,
    pub args: Vec<Value>,
    pub priority: i32,
    pub execution_timeout: Option<Duration>,
}

impl Statement {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }
}

impl From<SqlFragment> for Statement {
    fn from(fragment: SqlFragment) -> Self {
        Self {
            query: fragment.sql,
            args: fragment.args,
            ..Default::default()
        }
    }
}

pub type RowBatch = Vec<Map<String, Value>>;

/// Batches queued ahead of the consumer by streaming engines.
pub const STREAM_BUFFER_BATCHES: usize = 2;

/// Rows of a statement delivered in batches.
///
/// Dropping the stream stops the producer at its next batch.
pub struct RowStream {
    schema: Schema,
    rx: mpsc::Receiver<Result<RowBatch>>,
}

impl RowStream {
    pub fn new(schema: Schema, rx: mpsc::Receiver<Result<RowBatch>>) -> Self {
        Self { schema, rx }
    }

    /// Stream over an already materialized result.
    pub fn from_result(result: QueryResult, batch_rows: usize) -> Self {
        let batch_rows = batch_rows.max(1);
        let batches = result.rows.len().div_ceil(batch_rows).max(1);
        let (tx, rx) = mpsc::channel(batches);
        let mut rows = result.rows.into_iter().peekable();
        while rows.peek().is_some() {
            let batch: RowBatch = rows.by_ref().take(batch_rows).collect();
            if tx.try_send(Ok(batch)).is_err() {
                break;
            }
        }
        Self::new(result.schema, rx)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Next batch, `None` once the statement is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        self.rx.recv().await.transpose()
    }
}

/// A checked-out engine connection.
///
/// Temporary tables created through one connection are only visible to
/// statements on that same connection.
#[async_trait]
pub trait OlapConnection: Send + Sync {
    fn dialect(&self) -> &'static dyn Dialect;

    /// Run a statement that returns rows.
    async fn execute(&self, stmt: &Statement) -> Result<QueryResult>;

    /// Run a statement for its side effect.
    async fn exec(&self, stmt: &Statement) -> Result<()>;

    /// Run a statement that returns rows, delivering them in batches of at
    /// most `batch_rows`. Engines without a cursor buffer the full result.
    async fn stream(&self, stmt: &Statement, batch_rows: usize) -> Result<RowStream> {
        let result = self.execute(stmt).await?;
        Ok(RowStream::from_result(result, batch_rows))
    }
}

/// An engine handle that hands out connections.
#[async_trait]
pub trait Olap: Send + Sync {
    fn dialect(&self) -> &'static dyn Dialect;

    /// Check out a connection. Lower `priority` values may wait longer when
    /// the engine is saturated.
    async fn acquire(&self, priority: i32) -> Result<Arc<dyn OlapConnection>>;

    /// Run a statement on a fresh connection.
    async fn execute(&self, stmt: &Statement) -> Result<QueryResult> {
        let conn = self.acquire(stmt.priority).await?;
        conn.execute(stmt).await
    }
}

/// Run `f` with one connection held for its whole duration.
pub async fn with_connection<F, Fut, T>(olap: &dyn Olap, priority: i32, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn OlapConnection>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let conn = olap.acquire(priority).await?;
    f(conn).await
}

/// Await `fut` under the statement timeout, if any.
pub async fn run_with_timeout<T, Fut>(timeout: Option<Duration>, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| MetricsViewError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Drops a temporary table when it goes out of scope.
///
/// The drop is spawned onto the runtime so it still happens when the owning
/// future is cancelled mid-query. Call [`EnsuredDrop::finish`] on the normal
/// path to drop synchronously and observe errors.
pub struct EnsuredDrop {
    conn: Arc<dyn OlapConnection>,
    table: String,
    armed: bool,
}

impl EnsuredDrop {
    pub fn new(conn: Arc<dyn OlapConnection>, table: impl Into<String>) -> Self {
        Self {
            conn,
            table: table.into(),
            armed: true,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn drop_statement(&self) -> Statement {
        Statement::new(format!(
            "DROP TABLE IF EXISTS {}",
            self.conn.dialect().escape_identifier(&self.table)
        ))
    }

    pub async fn finish(mut self) -> Result<()> {
        self.armed = false;
        let stmt = self.drop_statement();
        self.conn.exec(&stmt).await
    }
}

impl Drop for EnsuredDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let stmt = self.drop_statement();
        let conn = self.conn.clone();
        let table = std::mem::take(&mut self.table);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = conn.exec(&stmt).await {
                        tracing::warn!(table = %table, error = %err, "failed to drop temporary table");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(table = %table, "no runtime available to drop temporary table");
            }
        }
    }
}
