pub mod cache;
pub mod db;
pub mod groups;
pub mod keys;
pub mod kv;
pub mod logs;
pub mod settings;
pub mod stats;

pub use cache::GroupCache;
pub use db::{connect, migrate};
pub use kv::{KvStore, MemoryStore};

/// Map a sqlx failure into the gateway taxonomy.
pub(crate) fn store_err(e: sqlx::Error) -> loadgate_core::GatewayError {
    loadgate_core::GatewayError::StoreError(e.to_string())
}
