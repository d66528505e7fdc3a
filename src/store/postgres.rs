use anyhow::{bail, Context, Result};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row as _};

use crate::logic::compile::SqlQuery;
use crate::model::{BindValue, Row};
use crate::store::traits::QueryRunner;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl QueryRunner for PostgresStore {
    async fn fetch_rows(&self, statement: &SqlQuery) -> Result<Vec<Row>> {
        // One JSON object per row keeps decoding independent of column types.
        let sql = format!("SELECT row_to_json(q) AS row FROM ({}) AS q", statement.sql);
        let mut query = sqlx::query(&sql);
        for value in &statement.binds {
            query = match value {
                BindValue::Text(s) => query.bind(s.clone()),
                BindValue::Uuid(id) => query.bind(*id),
                BindValue::Number(n) => query.bind(*n),
                BindValue::Integer(n) => query.bind(*n),
                BindValue::Timestamp(at) => query.bind(*at),
                BindValue::Boolean(b) => query.bind(*b),
                BindValue::TextArray(values) => query.bind(values.clone()),
                BindValue::UuidArray(values) => query.bind(values.clone()),
                BindValue::NumberArray(values) => query.bind(values.clone()),
                BindValue::IntegerArray(values) => query.bind(values.clone()),
            };
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to run query: {}", statement.sql))?;

        rows.into_iter()
            .map(|row| {
                let value: Value = row.try_get("row").context("Failed to decode row")?;
                match value {
                    Value::Object(map) => Ok(map),
                    other => bail!("Expected a JSON object per row, got {other}"),
                }
            })
            .collect()
    }
}
