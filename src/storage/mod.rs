pub mod engine;
pub mod store;

pub use engine::StorageEngine;
pub use store::{BatchOp, DurableStore, Namespace, Record};
