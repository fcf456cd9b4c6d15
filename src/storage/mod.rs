//! Broker storage.
//!
//! - [`backend`]: the [`StorageBackend`] and [`Transaction`] contracts
//! - [`memory_backend`]: in-process maps, for tests and single-node use
//! - [`sql`]: SQLite (serialized connection) and Postgres (pool)
//! - [`factory`]: backend selection from [`crate::config::Settings`]

mod backend;
mod factory;
mod memory_backend;
pub mod sql;

pub use backend::{
    delivery_order, ChangeKind, ChangeNotification, MessageQuery, StorageBackend, StoredMessage,
    Transaction, NOTIFICATION_CHANNEL_CAPACITY,
};
pub use factory::create_storage_backend;
pub use memory_backend::MemoryBackend;
pub use sql::{SqlBackend, SqlDialect};
