//! Pooled PostgreSQL model.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::postgres::PgListener;
use sqlx::{Any, AnyConnection, AnyPool};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::DatabaseConfig;
use crate::error::StorageError;
use crate::storage::ChangeNotification;

use super::dialect::parse_notify_payload;
use super::{ConnectionModel, SqlDialect, SqlSession, NOTIFY_CHANNEL};

/// Pause before retrying after the listener connection fails.
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct PostgresConnectionModel {
    pool: AnyPool,

    /// Database URL (for logging and the listener connection)
    database_url: String,
}

impl PostgresConnectionModel {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(u64::from(config.connect_timeout_seconds)))
            .idle_timeout(Duration::from_secs(u64::from(config.idle_timeout_seconds)))
            .connect(&config.url)
            .await
            .map_err(StorageError::from_sqlx)?;

        let model = Self {
            pool,
            database_url: config.url.clone(),
        };
        tracing::info!(
            pool_size = config.pool_size,
            url = %model.database_url_masked(),
            "PostgreSQL connection pool created"
        );
        Ok(model)
    }

    /// Get the database URL (masked for logging).
    pub fn database_url_masked(&self) -> String {
        mask_database_url(&self.database_url)
    }
}

fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let prefix = &url[..colon_pos + 1];
            let suffix = &url[at_pos..];
            // "postgres://user@host" has its only colon in the scheme
            if !url[colon_pos..].starts_with("://") {
                return format!("{}***{}", prefix, suffix);
            }
        }
    }
    url.to_string()
}

async fn forward_notifications(
    mut listener: PgListener,
    sink: broadcast::Sender<ChangeNotification>,
) {
    loop {
        match listener.recv().await {
            Ok(notification) => match parse_notify_payload(notification.payload()) {
                Some(change) => {
                    let _ = sink.send(change);
                }
                None => tracing::debug!(
                    payload = notification.payload(),
                    "Ignoring unrecognized change notification"
                ),
            },
            Err(e) => {
                tracing::warn!(error = %e, "PostgreSQL listener failed, retrying");
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl ConnectionModel for PostgresConnectionModel {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn begin(&self) -> Result<Box<dyn SqlSession>, StorageError> {
        let tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;
        Ok(Box::new(PostgresSession { tx }))
    }

    async fn listen(
        &self,
        sink: broadcast::Sender<ChangeNotification>,
    ) -> Result<Option<JoinHandle<()>>, StorageError> {
        let mut listener = PgListener::connect(&self.database_url)
            .await
            .map_err(StorageError::from_sqlx)?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(StorageError::from_sqlx)?;
        tracing::info!(channel = NOTIFY_CHANNEL, "Listening for change notifications");
        Ok(Some(tokio::spawn(forward_notifications(listener, sink))))
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}

struct PostgresSession {
    tx: sqlx::Transaction<'static, Any>,
}

#[async_trait]
impl SqlSession for PostgresSession {
    fn connection(&mut self) -> &mut AnyConnection {
        &mut *self.tx
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(StorageError::from_sqlx)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(StorageError::from_sqlx)
    }
}
