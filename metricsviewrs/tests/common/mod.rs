#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metricsview::dialect::{ClickHouseDialect, Dialect};
use metricsview::error::Result;
use metricsview::{
    ConnectorManager, DuckDbOlap, EngineConfig, MetricsViewRegistry, MetricsViewSpec, Olap, OlapConnection,
    QueryResult, Runtime, Statement,
};

pub const BIDS_VIEW: &str = r#"
name: bids
table: bids
time_dimension: ts
dimensions:
  - publisher
  - domain
measures:
  - name: records
    expression: count(*)
  - name: total_bid
    expression: sum(bid_price)
"#;

/// Engine double that records statements and answers with one canned result.
#[derive(Clone)]
pub struct FakeOlap {
    dialect: &'static dyn Dialect,
    result: QueryResult,
    pub statements: Arc<Mutex<Vec<String>>>,
}

impl FakeOlap {
    pub fn clickhouse(result: QueryResult) -> Self {
        Self {
            dialect: &ClickHouseDialect,
            result,
            statements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl OlapConnection for FakeOlap {
    fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    async fn execute(&self, stmt: &Statement) -> Result<QueryResult> {
        self.statements.lock().unwrap().push(stmt.query.clone());
        Ok(self.result.clone())
    }

    async fn exec(&self, stmt: &Statement) -> Result<()> {
        self.statements.lock().unwrap().push(stmt.query.clone());
        Ok(())
    }
}

#[async_trait]
impl Olap for FakeOlap {
    fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    async fn acquire(&self, _priority: i32) -> Result<Arc<dyn OlapConnection>> {
        Ok(Arc::new(self.clone()))
    }
}

pub fn view(yaml: &str) -> MetricsViewSpec {
    serde_yaml::from_str(yaml).unwrap()
}

/// In-memory DuckDB holding a small `bids` table.
pub async fn bids_olap() -> anyhow::Result<DuckDbOlap> {
    metricsview::logging::init();
    let olap = DuckDbOlap::in_memory()?;
    let conn = olap.acquire(0).await?;
    conn.exec(&Statement::new(
        "CREATE TABLE bids (ts TIMESTAMP, publisher VARCHAR, domain VARCHAR, bid_price DOUBLE)",
    ))
    .await?;
    conn.exec(&Statement::new(
        "INSERT INTO bids VALUES
            ('2024-01-01 10:00:00', 'acme', 'a.com', 1.0),
            ('2024-01-01 12:00:00', 'acme', 'b.com', 3.0),
            ('2024-01-02 09:00:00', 'globex', 'a.com', 2.0),
            ('2024-01-04 09:00:00', NULL, 'c.com', 4.0)",
    ))
    .await?;
    Ok(olap)
}

pub fn runtime_with(views: &[&str], olap: Arc<dyn Olap>, config: EngineConfig) -> Runtime {
    let registry = MetricsViewRegistry::from_views(views.iter().map(|y| view(y)).collect()).unwrap();
    let mut connectors = ConnectorManager::with_config(config);
    connectors.insert("main", olap);
    Runtime::new(registry, connectors)
}

pub async fn bids_runtime() -> anyhow::Result<Runtime> {
    let olap = bids_olap().await?;
    Ok(runtime_with(&[BIDS_VIEW], Arc::new(olap), EngineConfig::default()))
}
