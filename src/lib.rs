pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use api::handlers;
pub use api::routes;

pub use error::{EngineError, ValidationError};
pub use logic::{EngineSettings, QueryEngine};
pub use model::*;
pub use store::{MemoryRunner, PostgresStore, QueryRunner};
