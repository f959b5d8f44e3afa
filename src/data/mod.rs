//! Data layer: SQL row store and KV cache

pub mod cache;
pub mod models;
pub mod store;

pub use cache::{build_cache, Cache, SqlCache};
pub use models::*;
pub use store::{InstanceUpsert, Store, RELAY_SOFTWARE};
