pub mod entity;
pub mod filter;
pub mod node;
pub mod policy;
pub mod record;
pub mod request;

pub use entity::*;
pub use filter::*;
pub use node::*;
pub use policy::*;
pub use record::*;
pub use request::*;
