//! Persistence layer: record types and the ordered-KV store adapter.

mod models;
mod store;

pub use models::*;
pub use store::*;
