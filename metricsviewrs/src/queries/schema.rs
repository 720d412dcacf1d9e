use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::result::Schema;
use crate::runtime::Runtime;
use crate::security::SecurityClaims;

use super::{CacheableQuery, ResourceName};

/// Result types of every accessible dimension and measure.
///
/// Resolving it also checks that every field expression compiles on the
/// engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaQuery {
    pub metrics_view: String,
}

#[async_trait]
impl CacheableQuery for SchemaQuery {
    type Output = Schema;
    const KIND: &'static str = "MetricsViewSchema";

    fn deps(&self) -> Vec<ResourceName> {
        vec![ResourceName::metrics_view(&self.metrics_view)]
    }

    async fn resolve(&self, rt: &Runtime, claims: &SecurityClaims) -> Result<Schema> {
        let ctx = rt.view_context(&self.metrics_view, claims)?;
        let sql = ctx.builder()?.build_schema_probe()?;
        Ok(ctx.execute(sql).await?.schema)
    }
}
