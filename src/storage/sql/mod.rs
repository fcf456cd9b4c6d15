//! SQL storage over two connection models.
//!
//! All queries go through sqlx's `Any` driver, so the record mapping and the
//! statements in [`transaction`] are shared. What differs per database is
//! captured by two small seams:
//!
//! - [`SqlDialect`]: placeholder style, row locking, notification statement, DDL
//! - [`ConnectionModel`]: how a transaction gets a connection
//!   - [`SqliteConnectionModel`]: one connection behind an async mutex, one
//!     transaction in flight at a time
//!   - [`PostgresConnectionModel`]: a pool with concurrent transactions and a
//!     `LISTEN` connection for notifications from other processes

mod dialect;
mod postgres;
mod rows;
mod sqlite;
mod transaction;

pub use dialect::{SqlDialect, NOTIFY_CHANNEL, SCHEMA_VERSION};
pub use postgres::PostgresConnectionModel;
pub use sqlite::SqliteConnectionModel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{AnyConnection, Executor};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{DatabaseConfig, SqliteConfig};
use crate::error::StorageError;

use super::backend::{
    ChangeNotification, StorageBackend, Transaction, NOTIFICATION_CHANNEL_CAPACITY,
};
use transaction::SqlTransaction;

/// A connection holding an open database transaction.
#[async_trait]
pub trait SqlSession: Send {
    fn connection(&mut self) -> &mut AnyConnection;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// How transactions obtain connections.
#[async_trait]
pub trait ConnectionModel: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    /// Acquire a connection and begin a transaction on it.
    async fn begin(&self) -> Result<Box<dyn SqlSession>, StorageError>;

    /// Forward change notifications published by other processes into `sink`.
    async fn listen(
        &self,
        _sink: broadcast::Sender<ChangeNotification>,
    ) -> Result<Option<JoinHandle<()>>, StorageError> {
        Ok(None)
    }

    async fn close(&self);
}

/// SQL storage backend.
pub struct SqlBackend {
    model: Arc<dyn ConnectionModel>,
    notifications: broadcast::Sender<ChangeNotification>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SqlBackend {
    pub fn new(model: Arc<dyn ConnectionModel>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            model,
            notifications,
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect a single-connection SQLite backend.
    pub async fn sqlite(config: &SqliteConfig) -> Result<Self, StorageError> {
        let model = SqliteConnectionModel::connect(config).await?;
        Ok(Self::new(Arc::new(model)))
    }

    /// Connect a pooled Postgres backend.
    pub async fn postgres(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let model = PostgresConnectionModel::connect(config).await?;
        Ok(Self::new(Arc::new(model)))
    }

    pub fn dialect(&self) -> SqlDialect {
        self.model.dialect()
    }

    fn set_listener(&self, handle: JoinHandle<()>) {
        let mut slot = self.listener.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }
}

#[async_trait]
impl StorageBackend for SqlBackend {
    fn name(&self) -> &'static str {
        self.model.dialect().name()
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        let dialect = self.model.dialect();
        let mut session = self.model.begin().await?;
        let result = async {
            for statement in dialect.schema() {
                session.connection().execute(*statement).await?;
            }
            let record = dialect.sql(
                "INSERT INTO broker_migration (version, applied_at) VALUES (?, ?) \
                 ON CONFLICT (version) DO NOTHING",
            );
            sqlx::query(&record)
                .bind(SCHEMA_VERSION)
                .bind(chrono::Utc::now().timestamp_millis())
                .execute(session.connection())
                .await?;
            Ok::<_, sqlx::Error>(())
        }
        .await;

        match result {
            Ok(()) => session.commit().await?,
            Err(e) => {
                if let Err(rollback_err) = session.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after failed migration failed");
                }
                return Err(StorageError::from_sqlx(e));
            }
        }

        if let Some(handle) = self.model.listen(self.notifications.clone()).await? {
            self.set_listener(handle);
        }

        tracing::info!(
            dialect = dialect.name(),
            version = SCHEMA_VERSION,
            "SQL schema ready"
        );
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable(format!(
                "{} backend is shut down",
                self.name()
            )));
        }
        let session = self.model.begin().await?;
        Ok(Box::new(SqlTransaction::new(
            session,
            self.model.dialect(),
            self.notifications.clone(),
        )))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notifications.subscribe()
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = listener {
            handle.abort();
        }
        self.model.close().await;
    }
}
