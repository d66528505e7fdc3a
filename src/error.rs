use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// A single rejected request parameter. `trace` is the dotted parameter path
/// as the client wrote it (`owner.limit`, `df.owner.email`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidationError {
    pub trace: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(trace: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            trace: trace.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid parameter '{}': {}", self.trace, self.message)
    }
}

impl Serialize for ValidationError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Every rejected parameter of the request, across the whole node tree.
    #[error("request contains {} invalid parameter(s)", .0.len())]
    Validation(Vec<ValidationError>),
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("configuration error in '{entity}': {message}")]
    Configuration { entity: String, message: String },
    #[error("query execution failed: {0:#}")]
    Execution(#[source] anyhow::Error),
    #[error("relation '{relation}' returned a row that matches no parent row (key {key})")]
    Invariant { relation: String, key: String },
}

impl EngineError {
    pub fn config(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Errors the client caused, as opposed to deployment or runtime faults.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownEntity(_))
    }
}
