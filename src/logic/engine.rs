use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::error::EngineError;
use crate::logic::execute::Executor;
use crate::logic::format;
use crate::logic::normalize::normalize;
use crate::logic::validate::Validator;
use crate::model::{Node, RawRequest, Registry};
use crate::store::QueryRunner;

pub const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Overrides the registry's maximum relation depth.
    pub max_depth: Option<usize>,
    /// Statements of one request allowed in flight at once.
    pub max_concurrent_queries: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_depth: None,
            max_concurrent_queries: DEFAULT_MAX_CONCURRENT_QUERIES,
        }
    }
}

/// Normalizes, validates, executes and formats requests against one
/// registry and runner.
pub struct QueryEngine<R: QueryRunner> {
    registry: Arc<Registry>,
    runner: Arc<R>,
    settings: EngineSettings,
}

impl<R: QueryRunner> QueryEngine<R> {
    pub fn new(registry: Arc<Registry>, runner: Arc<R>) -> Self {
        Self {
            registry,
            runner,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Build the validated node tree for a request without running it.
    pub fn validate(
        &self,
        entity: &str,
        identifier: Option<&str>,
        request: RawRequest,
    ) -> Result<Node, EngineError> {
        let params = normalize(request);
        let mut validator = Validator::new(&self.registry);
        if let Some(max_depth) = self.settings.max_depth {
            validator = validator.with_max_depth(max_depth);
        }
        validator.validate(entity, identifier, params)
    }

    /// Answer a request. Point lookups yield a document or `null`.
    pub async fn run(
        &self,
        entity: &str,
        identifier: Option<&str>,
        request: RawRequest,
    ) -> Result<Value, EngineError> {
        let started = Instant::now();
        let node = match self.validate(entity, identifier, request) {
            Ok(node) => node,
            Err(err) => {
                debug!("Rejected request for {entity}: {err}");
                return Err(err);
            }
        };

        let executor = Executor::new(self.runner.as_ref(), self.settings.max_concurrent_queries);
        let result = executor.execute(&node).await?;
        info!(
            "Resolved {}{} in {:?}",
            node.name(),
            identifier.map(|id| format!("/{id}")).unwrap_or_default(),
            started.elapsed()
        );
        Ok(format::render(&node, &result))
    }
}
