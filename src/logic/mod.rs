pub mod compile;
pub mod engine;
pub mod execute;
pub mod filter_grammar;
pub mod format;
pub mod normalize;
pub mod validate;

pub use compile::{SqlBuilder, SqlQuery};
pub use engine::*;
pub use execute::Executor;
pub use filter_grammar::{compile_value, FilterField, GrammarError};
pub use format::{prune, render};
pub use normalize::normalize;
pub use validate::Validator;
