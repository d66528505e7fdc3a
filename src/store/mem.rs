use anyhow::Result;
use parking_lot::Mutex;

use crate::logic::compile::SqlQuery;
use crate::model::Row;
use crate::store::traits::QueryRunner;

type Handler = dyn Fn(&SqlQuery) -> Result<Vec<Row>> + Send + Sync;

/// In-process runner answering every statement through a closure. Keeps a
/// log of the statements it was asked to run.
pub struct MemoryRunner {
    handler: Box<Handler>,
    log: Mutex<Vec<SqlQuery>>,
}

impl MemoryRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&SqlQuery) -> Result<Vec<Row>> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        }
    }

    /// A runner returning no rows for any statement.
    pub fn empty() -> Self {
        Self::new(|_| Ok(Vec::new()))
    }

    /// Statements run so far, in the order they were issued.
    pub fn queries(&self) -> Vec<SqlQuery> {
        self.log.lock().clone()
    }

    pub fn query_count(&self) -> usize {
        self.log.lock().len()
    }
}

impl std::fmt::Debug for MemoryRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRunner")
            .field("queries", &self.query_count())
            .finish()
    }
}

#[async_trait::async_trait]
impl QueryRunner for MemoryRunner {
    async fn fetch_rows(&self, query: &SqlQuery) -> Result<Vec<Row>> {
        self.log.lock().push(query.clone());
        (self.handler)(query)
    }
}
