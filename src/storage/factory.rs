//! Storage backend factory

use std::sync::Arc;

use crate::config::Settings;
use crate::error::StorageError;

use super::backend::StorageBackend;
use super::memory_backend::MemoryBackend;
use super::sql::SqlBackend;

/// Create a storage backend based on configuration.
///
/// Returns the implementation named by `store.backend`:
/// - `"sqlite"`: a single-connection [`SqlBackend`] on `sqlite.url`
/// - `"postgres"`: a pooled [`SqlBackend`] on `database.url`
/// - `"memory"` (default): a [`MemoryBackend`]
///
/// Unknown names fall back to memory. The schema is not created here;
/// `Store::start` runs the migration.
///
/// # Example
///
/// ```rust,no_run
/// # use ara_message_broker::config::Settings;
/// # use ara_message_broker::storage::create_storage_backend;
/// # use ara_message_broker::{Store, StoreOptions};
/// # async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
/// let backend = create_storage_backend(&settings).await?;
/// let store = Store::new(backend, StoreOptions::from_settings(&settings));
/// store.start().await?;
/// # Ok(())
/// # }
/// ```
pub async fn create_storage_backend(
    settings: &Settings,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match settings.store.backend.trim().to_ascii_lowercase().as_str() {
        "sqlite" => {
            tracing::info!(backend = "sqlite", "Creating SQLite storage backend");
            Ok(Arc::new(SqlBackend::sqlite(&settings.sqlite).await?))
        }
        "postgres" | "postgresql" => {
            tracing::info!(
                backend = "postgres",
                pool_size = settings.database.pool_size,
                "Creating PostgreSQL storage backend"
            );
            Ok(Arc::new(SqlBackend::postgres(&settings.database).await?))
        }
        "memory" => {
            tracing::info!(backend = "memory", "Creating memory storage backend");
            Ok(Arc::new(MemoryBackend::new()))
        }
        other => {
            tracing::warn!(
                backend = %other,
                "Unknown storage backend, falling back to memory"
            );
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_is_default() {
        let backend = create_storage_backend(&Settings::default()).await.unwrap();
        assert_eq!(backend.name(), "memory");
    }

    #[tokio::test]
    async fn test_unknown_falls_back_to_memory() {
        let mut settings = Settings::default();
        settings.store.backend = "cassandra".to_string();
        let backend = create_storage_backend(&settings).await.unwrap();
        assert_eq!(backend.name(), "memory");
    }

    #[tokio::test]
    async fn test_sqlite_in_memory() {
        let mut settings = Settings::default();
        settings.store.backend = "SQLite".to_string();
        settings.sqlite.url = "sqlite::memory:".to_string();
        let backend = create_storage_backend(&settings).await.unwrap();
        assert_eq!(backend.name(), "sqlite");
        backend.migrate().await.unwrap();
        backend.shutdown().await;
    }
}
