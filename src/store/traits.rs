use anyhow::Result;

use crate::logic::compile::SqlQuery;
use crate::model::Row;

/// Executes compiled statements. Every row comes back as a JSON object
/// keyed by column name.
#[async_trait::async_trait]
pub trait QueryRunner: Send + Sync {
    async fn fetch_rows(&self, query: &SqlQuery) -> Result<Vec<Row>>;
}
