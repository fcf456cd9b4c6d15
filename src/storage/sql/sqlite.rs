//! Single-connection SQLite model.
//!
//! SQLite allows one writer at a time, so every transaction runs on the same
//! connection and callers queue on an async mutex for it.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{AnyConnection, Connection, Executor};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::SqliteConfig;
use crate::error::StorageError;

use super::{ConnectionModel, SqlDialect, SqlSession};

struct SerializedConnection {
    conn: AnyConnection,
    /// Set while a BEGIN has not been matched by COMMIT or ROLLBACK
    in_transaction: bool,
}

impl SerializedConnection {
    /// Roll back a transaction abandoned by a dropped session.
    async fn reset(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Err(e) = self.conn.execute("ROLLBACK").await {
            tracing::warn!(error = %e, "Failed to roll back abandoned SQLite transaction");
        }
        self.in_transaction = false;
    }
}

pub struct SqliteConnectionModel {
    connection: Arc<Mutex<SerializedConnection>>,
}

impl SqliteConnectionModel {
    pub async fn connect(config: &SqliteConfig) -> Result<Self, StorageError> {
        sqlx::any::install_default_drivers();
        let mut conn = AnyConnection::connect(&config.url)
            .await
            .map_err(StorageError::from_sqlx)?;

        let busy_timeout_ms = u64::from(config.busy_timeout_seconds) * 1000;
        for pragma in [
            "PRAGMA foreign_keys = ON".to_string(),
            "PRAGMA journal_mode = WAL".to_string(),
            format!("PRAGMA busy_timeout = {busy_timeout_ms}"),
        ] {
            conn.execute(pragma.as_str())
                .await
                .map_err(StorageError::from_sqlx)?;
        }

        tracing::info!(url = %config.url, "SQLite connection opened");

        Ok(Self {
            connection: Arc::new(Mutex::new(SerializedConnection {
                conn,
                in_transaction: false,
            })),
        })
    }
}

#[async_trait]
impl ConnectionModel for SqliteConnectionModel {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn begin(&self) -> Result<Box<dyn SqlSession>, StorageError> {
        let mut guard = self.connection.clone().lock_owned().await;
        guard.reset().await;
        guard
            .conn
            .execute("BEGIN IMMEDIATE")
            .await
            .map_err(StorageError::from_sqlx)?;
        guard.in_transaction = true;
        Ok(Box::new(SqliteSession { guard }))
    }

    async fn close(&self) {
        self.connection.lock().await.reset().await;
        tracing::info!("SQLite connection released");
    }
}

struct SqliteSession {
    guard: OwnedMutexGuard<SerializedConnection>,
}

#[async_trait]
impl SqlSession for SqliteSession {
    fn connection(&mut self) -> &mut AnyConnection {
        &mut self.guard.conn
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.guard
            .conn
            .execute("COMMIT")
            .await
            .map_err(StorageError::from_sqlx)?;
        self.guard.in_transaction = false;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.guard.in_transaction = false;
        self.guard
            .conn
            .execute("ROLLBACK")
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    fn memory_config() -> SqliteConfig {
        SqliteConfig {
            url: "sqlite::memory:".to_string(),
            busy_timeout_seconds: 1,
        }
    }

    async fn count_rows(model: &SqliteConnectionModel) -> i64 {
        let mut session = model.begin().await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM t")
            .fetch_one(session.connection())
            .await
            .unwrap();
        let n: i64 = row.try_get("n").unwrap();
        session.commit().await.unwrap();
        n
    }

    #[tokio::test]
    async fn test_dropped_session_is_rolled_back() {
        let model = SqliteConnectionModel::connect(&memory_config()).await.unwrap();

        let mut session = model.begin().await.unwrap();
        session
            .connection()
            .execute("CREATE TABLE t (v BIGINT)")
            .await
            .unwrap();
        session.commit().await.unwrap();

        {
            let mut session = model.begin().await.unwrap();
            session
                .connection()
                .execute("INSERT INTO t (v) VALUES (1)")
                .await
                .unwrap();
        }

        assert_eq!(count_rows(&model).await, 0);
    }

    #[tokio::test]
    async fn test_sessions_are_serialized() {
        let model = Arc::new(SqliteConnectionModel::connect(&memory_config()).await.unwrap());
        let mut session = model.begin().await.unwrap();
        session
            .connection()
            .execute("CREATE TABLE t (v BIGINT)")
            .await
            .unwrap();

        let waiting = {
            let model = model.clone();
            tokio::spawn(async move { model.begin().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        session.commit().await.unwrap();
        waiting.await.unwrap().unwrap();
    }
}
