use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::{Executor, Row};
use tokio::sync::broadcast;

use crate::error::StorageError;
use crate::queue::{DeadLetterTarget, MessageCounts, Queue};
use crate::storage::backend::{
    ChangeNotification, MessageQuery, StoredMessage, Transaction,
};
use crate::topic::{Subscription, Topic};
use crate::user::User;

use super::dialect::SqlDialect;
use super::rows::{
    encode_map, to_i64, to_millis, to_millis_opt, MessageRow, QueueRow, SubscriptionRow,
    TopicRow, UserRow,
};
use super::SqlSession;

const QUEUE_COLUMNS: &str = "name, created_at, last_modified_at, expires_at, paused, delay_ms, \
    visibility_timeout_ms, max_message_size, message_retention_period_ms, \
    receive_message_wait_time_ms, max_receive_count, dead_letter_queue_name, \
    dead_letter_topic_name, expires_ms, nak_expire_behavior, tags";

const MESSAGE_COLUMNS: &str = "seq, id, queue_name, body, attributes, priority, sent_at, order_by, \
    delay_until, expires_at, not_visible_until, receipt_handle, receive_count, \
    first_received_at, last_nak_reason, deduplication_id";

const MESSAGE_ORDER: &str = "ORDER BY priority DESC, order_by ASC, seq ASC";

/// Retained: no retention deadline, or not yet past it.
const RETAINED: &str = "(expires_at IS NULL OR expires_at >= ?)";
const NOT_VISIBLE: &str = "(receipt_handle IS NOT NULL AND COALESCE(not_visible_until, 0) > ?)";
const DELAYED: &str = "(delay_until IS NOT NULL AND delay_until > ?)";

const TOPIC_COLUMNS: &str = "name, tags, created_at, last_modified_at";
const SUBSCRIPTION_COLUMNS: &str = "id, topic_name, protocol, queue_name";
const USER_COLUMNS: &str = "id, username, password_hash, access_key_id, secret_access_key";

pub(super) struct SqlTransaction {
    session: Box<dyn SqlSession>,
    dialect: SqlDialect,
    notifications: broadcast::Sender<ChangeNotification>,
    pending: Vec<ChangeNotification>,
}

impl SqlTransaction {
    pub(super) fn new(
        session: Box<dyn SqlSession>,
        dialect: SqlDialect,
        notifications: broadcast::Sender<ChangeNotification>,
    ) -> Self {
        Self {
            session,
            dialect,
            notifications,
            pending: Vec::new(),
        }
    }

    async fn fetch_messages(
        &mut self,
        sql: &str,
        binds: MessageBinds<'_>,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let sql = self.dialect.sql(sql);
        let mut query = sqlx::query_as::<_, MessageRow>(&sql).bind(binds.queue_name.to_string());
        for value in binds.values {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    async fn execute_count(&mut self, sql: &str, queue_name: &str, extra: Option<i64>) -> Result<u64, StorageError> {
        let sql = self.dialect.sql(sql);
        let mut query = sqlx::query(&sql).bind(queue_name.to_string());
        if let Some(value) = extra {
            query = query.bind(value);
        }
        let result = query
            .execute(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(result.rows_affected())
    }
}

/// Queue name followed by integer parameters, in placeholder order.
struct MessageBinds<'a> {
    queue_name: &'a str,
    values: Vec<i64>,
}

fn queue_bind_values(queue: &Queue) -> Result<QueueValues, StorageError> {
    let config = &queue.config;
    Ok(QueueValues {
        created_at: to_millis(queue.created_at),
        last_modified_at: to_millis(queue.last_modified_at),
        expires_at: to_millis_opt(queue.expires_at),
        paused: i64::from(queue.paused),
        delay_ms: to_i64(config.delay_ms),
        visibility_timeout_ms: to_i64(config.visibility_timeout_ms),
        max_message_size: to_i64(config.max_message_size),
        message_retention_period_ms: to_i64(config.message_retention_period_ms),
        receive_message_wait_time_ms: to_i64(config.receive_message_wait_time_ms),
        max_receive_count: config.max_receive_count.map(i64::from),
        dead_letter_queue_name: config
            .dead_letter
            .as_ref()
            .and_then(|t| t.queue_name())
            .map(str::to_string),
        dead_letter_topic_name: config
            .dead_letter
            .as_ref()
            .and_then(|t| t.topic_name())
            .map(str::to_string),
        expires_ms: to_i64(config.expires_ms),
        nak_expire_behavior: serde_json::to_string(&config.nak_expire_behavior)?,
        tags: encode_map(&config.tags)?,
    })
}

struct QueueValues {
    created_at: i64,
    last_modified_at: i64,
    expires_at: Option<i64>,
    paused: i64,
    delay_ms: Option<i64>,
    visibility_timeout_ms: Option<i64>,
    max_message_size: Option<i64>,
    message_retention_period_ms: Option<i64>,
    receive_message_wait_time_ms: Option<i64>,
    max_receive_count: Option<i64>,
    dead_letter_queue_name: Option<String>,
    dead_letter_topic_name: Option<String>,
    expires_ms: Option<i64>,
    nak_expire_behavior: String,
    tags: String,
}

fn read_count(row: &AnyRow, column: &str) -> Result<u64, StorageError> {
    let value: i64 = row.try_get(column).map_err(StorageError::from_sqlx)?;
    u64::try_from(value).map_err(|_| StorageError::InvalidRow(format!("negative {column}")))
}

#[async_trait]
impl Transaction for SqlTransaction {
    async fn insert_queue(&mut self, queue: &Queue) -> Result<(), StorageError> {
        let v = queue_bind_values(queue)?;
        let sql = self.dialect.sql(
            "INSERT INTO broker_queue (name, created_at, last_modified_at, expires_at, paused, \
             delay_ms, visibility_timeout_ms, max_message_size, message_retention_period_ms, \
             receive_message_wait_time_ms, max_receive_count, dead_letter_queue_name, \
             dead_letter_topic_name, expires_ms, nak_expire_behavior, tags) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        );
        sqlx::query(&sql)
            .bind(queue.name.clone())
            .bind(v.created_at)
            .bind(v.last_modified_at)
            .bind(v.expires_at)
            .bind(v.paused)
            .bind(v.delay_ms)
            .bind(v.visibility_timeout_ms)
            .bind(v.max_message_size)
            .bind(v.message_retention_period_ms)
            .bind(v.receive_message_wait_time_ms)
            .bind(v.max_receive_count)
            .bind(v.dead_letter_queue_name)
            .bind(v.dead_letter_topic_name)
            .bind(v.expires_ms)
            .bind(v.nak_expire_behavior)
            .bind(v.tags)
            .execute(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn update_queue(&mut self, queue: &Queue) -> Result<bool, StorageError> {
        let v = queue_bind_values(queue)?;
        let sql = self.dialect.sql(
            "UPDATE broker_queue SET created_at = ?, last_modified_at = ?, expires_at = ?, \
             paused = ?, delay_ms = ?, visibility_timeout_ms = ?, max_message_size = ?, \
             message_retention_period_ms = ?, receive_message_wait_time_ms = ?, \
             max_receive_count = ?, dead_letter_queue_name = ?, dead_letter_topic_name = ?, \
             expires_ms = ?, nak_expire_behavior = ?, tags = ? WHERE name = ?",
        );
        let result = sqlx::query(&sql)
            .bind(v.created_at)
            .bind(v.last_modified_at)
            .bind(v.expires_at)
            .bind(v.paused)
            .bind(v.delay_ms)
            .bind(v.visibility_timeout_ms)
            .bind(v.max_message_size)
            .bind(v.message_retention_period_ms)
            .bind(v.receive_message_wait_time_ms)
            .bind(v.max_receive_count)
            .bind(v.dead_letter_queue_name)
            .bind(v.dead_letter_topic_name)
            .bind(v.expires_ms)
            .bind(v.nak_expire_behavior)
            .bind(v.tags)
            .bind(queue.name.clone())
            .execute(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_queue(&mut self, name: &str) -> Result<Option<Queue>, StorageError> {
        let sql = self
            .dialect
            .sql(&format!("SELECT {QUEUE_COLUMNS} FROM broker_queue WHERE name = ?"))
            .into_owned();
        let row = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(name.to_string())
            .fetch_optional(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        row.map(Queue::try_from).transpose()
    }

    async fn list_queues(&mut self) -> Result<Vec<Queue>, StorageError> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM broker_queue ORDER BY name");
        let rows = sqlx::query_as::<_, QueueRow>(&sql)
            .fetch_all(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        rows.into_iter().map(Queue::try_from).collect()
    }

    async fn delete_queue(&mut self, name: &str) -> Result<bool, StorageError> {
        self.execute_count("DELETE FROM broker_message WHERE queue_name = ?", name, None)
            .await?;
        self.execute_count(
            "DELETE FROM broker_subscription WHERE queue_name = ?",
            name,
            None,
        )
        .await?;
        let deleted = self
            .execute_count("DELETE FROM broker_queue WHERE name = ?", name, None)
            .await?;
        Ok(deleted > 0)
    }

    async fn find_queues_by_dead_letter(
        &mut self,
        target: &DeadLetterTarget,
    ) -> Result<Vec<String>, StorageError> {
        let (column, name) = match target {
            DeadLetterTarget::Queue(name) => ("dead_letter_queue_name", name),
            DeadLetterTarget::Topic(name) => ("dead_letter_topic_name", name),
        };
        let sql = self
            .dialect
            .sql(&format!(
                "SELECT name FROM broker_queue WHERE {column} = ? ORDER BY name"
            ))
            .into_owned();
        let rows = sqlx::query(&sql)
            .bind(name.clone())
            .fetch_all(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StorageError::from_sqlx))
            .collect()
    }

    async fn insert_message(&mut self, message: &StoredMessage) -> Result<i64, StorageError> {
        let sql = self.dialect.sql(
            "INSERT INTO broker_message (id, queue_name, body, attributes, priority, sent_at, \
             order_by, delay_until, expires_at, not_visible_until, receipt_handle, receive_count, \
             first_received_at, last_nak_reason, deduplication_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING seq",
        );
        let row = sqlx::query(&sql)
            .bind(message.id.clone())
            .bind(message.queue_name.clone())
            .bind(message.body.clone())
            .bind(encode_map(&message.attributes)?)
            .bind(message.priority)
            .bind(to_millis(message.sent_at))
            .bind(to_millis(message.order_by))
            .bind(to_millis_opt(message.delay_until))
            .bind(to_millis_opt(message.expires_at))
            .bind(to_millis_opt(message.not_visible_until))
            .bind(message.receipt_handle.clone())
            .bind(i64::from(message.receive_count))
            .bind(to_millis_opt(message.first_received_at))
            .bind(message.last_nak_reason.clone())
            .bind(message.deduplication_id.clone())
            .fetch_one(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        row.try_get::<i64, _>("seq").map_err(StorageError::from_sqlx)
    }

    async fn update_message(&mut self, message: &StoredMessage) -> Result<bool, StorageError> {
        let sql = self.dialect.sql(
            "UPDATE broker_message SET body = ?, attributes = ?, priority = ?, order_by = ?, \
             delay_until = ?, expires_at = ?, not_visible_until = ?, receipt_handle = ?, \
             receive_count = ?, first_received_at = ?, last_nak_reason = ?, deduplication_id = ? \
             WHERE queue_name = ? AND id = ?",
        );
        let result = sqlx::query(&sql)
            .bind(message.body.clone())
            .bind(encode_map(&message.attributes)?)
            .bind(message.priority)
            .bind(to_millis(message.order_by))
            .bind(to_millis_opt(message.delay_until))
            .bind(to_millis_opt(message.expires_at))
            .bind(to_millis_opt(message.not_visible_until))
            .bind(message.receipt_handle.clone())
            .bind(i64::from(message.receive_count))
            .bind(to_millis_opt(message.first_received_at))
            .bind(message.last_nak_reason.clone())
            .bind(message.deduplication_id.clone())
            .bind(message.queue_name.clone())
            .bind(message.id.clone())
            .execute(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_message(
        &mut self,
        queue_name: &str,
        id: &str,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let sql = self
            .dialect
            .sql(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM broker_message WHERE queue_name = ? AND id = ?"
            ))
            .into_owned();
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(queue_name.to_string())
            .bind(id.to_string())
            .fetch_optional(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        row.map(StoredMessage::try_from).transpose()
    }

    async fn find_message_by_receipt_handle(
        &mut self,
        queue_name: &str,
        receipt_handle: &str,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let sql = self
            .dialect
            .sql(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM broker_message \
                 WHERE queue_name = ? AND receipt_handle = ?"
            ))
            .into_owned();
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(queue_name.to_string())
            .bind(receipt_handle.to_string())
            .fetch_optional(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        row.map(StoredMessage::try_from).transpose()
    }

    async fn find_message_by_deduplication_id(
        &mut self,
        queue_name: &str,
        deduplication_id: &str,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let sql = self
            .dialect
            .sql(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM broker_message \
                 WHERE queue_name = ? AND deduplication_id = ?"
            ))
            .into_owned();
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(queue_name.to_string())
            .bind(deduplication_id.to_string())
            .fetch_optional(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        row.map(StoredMessage::try_from).transpose()
    }

    async fn query_messages(
        &mut self,
        queue_name: &str,
        query: &MessageQuery,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let now = to_millis(query.now);
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM broker_message WHERE queue_name = ? AND {RETAINED}"
        );
        let mut values = vec![now];
        if !query.include_not_visible {
            sql.push_str(&format!(" AND NOT {NOT_VISIBLE}"));
            values.push(now);
        }
        if !query.include_delayed {
            // A not-visible message is never also delayed, so this only drops truly delayed rows.
            sql.push_str(&format!(" AND NOT ({DELAYED} AND NOT {NOT_VISIBLE})"));
            values.push(now);
            values.push(now);
        }
        sql.push(' ');
        sql.push_str(MESSAGE_ORDER);
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if !query.include_not_visible {
            sql.push_str(self.dialect.row_lock());
        }
        self.fetch_messages(&sql, MessageBinds { queue_name, values })
            .await
    }

    async fn find_expired_deliveries(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM broker_message WHERE queue_name = ? \
             AND receipt_handle IS NOT NULL \
             AND (not_visible_until IS NULL OR not_visible_until <= ?) {MESSAGE_ORDER}{}",
            self.dialect.row_lock()
        );
        self.fetch_messages(
            &sql,
            MessageBinds {
                queue_name,
                values: vec![to_millis(now)],
            },
        )
        .await
    }

    async fn count_messages(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageCounts, StorageError> {
        let sql = self
            .dialect
            .sql(&format!(
                "SELECT \
                 COUNT(CASE WHEN NOT {NOT_VISIBLE} AND NOT {DELAYED} THEN 1 END) AS visible, \
                 COUNT(CASE WHEN NOT {NOT_VISIBLE} AND {DELAYED} THEN 1 END) AS delayed, \
                 COUNT(CASE WHEN {NOT_VISIBLE} THEN 1 END) AS not_visible \
                 FROM broker_message WHERE queue_name = ? AND {RETAINED}"
            ))
            .into_owned();
        let now = to_millis(now);
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(queue_name.to_string())
            .bind(now)
            .fetch_one(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(MessageCounts {
            visible: read_count(&row, "visible")?,
            delayed: read_count(&row, "delayed")?,
            not_visible: read_count(&row, "not_visible")?,
        })
    }

    async fn delete_message(&mut self, queue_name: &str, id: &str) -> Result<bool, StorageError> {
        let sql = self
            .dialect
            .sql("DELETE FROM broker_message WHERE queue_name = ? AND id = ?");
        let result = sqlx::query(&sql)
            .bind(queue_name.to_string())
            .bind(id.to_string())
            .execute(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired_messages(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        self.execute_count(
            "DELETE FROM broker_message WHERE queue_name = ? \
             AND expires_at IS NOT NULL AND expires_at < ?",
            queue_name,
            Some(to_millis(now)),
        )
        .await
    }

    async fn purge_messages(&mut self, queue_name: &str) -> Result<u64, StorageError> {
        self.execute_count(
            "DELETE FROM broker_message WHERE queue_name = ?",
            queue_name,
            None,
        )
        .await
    }

    async fn insert_topic(&mut self, topic: &Topic) -> Result<(), StorageError> {
        let sql = self.dialect.sql(
            "INSERT INTO broker_topic (name, tags, created_at, last_modified_at) VALUES (?, ?, ?, ?)",
        );
        sqlx::query(&sql)
            .bind(topic.name.clone())
            .bind(encode_map(&topic.tags)?)
            .bind(to_millis(topic.created_at))
            .bind(to_millis(topic.last_modified_at))
            .execute(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn find_topic(&mut self, name: &str) -> Result<Option<Topic>, StorageError> {
        let sql = self
            .dialect
            .sql(&format!("SELECT {TOPIC_COLUMNS} FROM broker_topic WHERE name = ?"))
            .into_owned();
        let row = sqlx::query_as::<_, TopicRow>(&sql)
            .bind(name.to_string())
            .fetch_optional(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        row.map(Topic::try_from).transpose()
    }

    async fn list_topics(&mut self) -> Result<Vec<Topic>, StorageError> {
        let sql = format!("SELECT {TOPIC_COLUMNS} FROM broker_topic ORDER BY name");
        let rows = sqlx::query_as::<_, TopicRow>(&sql)
            .fetch_all(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        rows.into_iter().map(Topic::try_from).collect()
    }

    async fn delete_topic(&mut self, name: &str) -> Result<bool, StorageError> {
        self.execute_count(
            "DELETE FROM broker_subscription WHERE topic_name = ?",
            name,
            None,
        )
        .await?;
        let deleted = self
            .execute_count("DELETE FROM broker_topic WHERE name = ?", name, None)
            .await?;
        Ok(deleted > 0)
    }

    async fn insert_subscription(&mut self, subscription: &Subscription) -> Result<bool, StorageError> {
        let sql = self.dialect.sql(
            "INSERT INTO broker_subscription (id, topic_name, protocol, queue_name) \
             VALUES (?, ?, ?, ?) ON CONFLICT (topic_name, queue_name) DO NOTHING",
        );
        let result = sqlx::query(&sql)
            .bind(subscription.id.clone())
            .bind(subscription.topic_name.clone())
            .bind(subscription.protocol.as_str().to_string())
            .bind(subscription.queue_name.clone())
            .execute(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_subscription(
        &mut self,
        topic_name: &str,
        queue_name: &str,
    ) -> Result<Option<Subscription>, StorageError> {
        let sql = self
            .dialect
            .sql(&format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM broker_subscription \
                 WHERE topic_name = ? AND queue_name = ?"
            ))
            .into_owned();
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(topic_name.to_string())
            .bind(queue_name.to_string())
            .fetch_optional(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        row.map(Subscription::try_from).transpose()
    }

    async fn list_subscriptions(&mut self, topic_name: &str) -> Result<Vec<Subscription>, StorageError> {
        let sql = self
            .dialect
            .sql(&format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM broker_subscription \
                 WHERE topic_name = ? ORDER BY seq"
            ))
            .into_owned();
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(topic_name.to_string())
            .fetch_all(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn delete_subscription(&mut self, id: &str) -> Result<bool, StorageError> {
        let sql = self.dialect.sql("DELETE FROM broker_subscription WHERE id = ?");
        let result = sqlx::query(&sql)
            .bind(id.to_string())
            .execute(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StorageError> {
        let sql = self.dialect.sql(
            "INSERT INTO broker_user (id, username, password_hash, access_key_id, secret_access_key) \
             VALUES (?, ?, ?, ?, ?)",
        );
        sqlx::query(&sql)
            .bind(user.id.clone())
            .bind(user.username.clone())
            .bind(user.password_hash.clone())
            .bind(user.access_key_id.clone())
            .bind(user.secret_access_key.clone())
            .execute(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn find_user_by_username(&mut self, username: &str) -> Result<Option<User>, StorageError> {
        let sql = self
            .dialect
            .sql(&format!("SELECT {USER_COLUMNS} FROM broker_user WHERE username = ?"))
            .into_owned();
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(username.to_string())
            .fetch_optional(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(row.map(User::from))
    }

    async fn find_user_by_access_key_id(
        &mut self,
        access_key_id: &str,
    ) -> Result<Option<User>, StorageError> {
        let sql = self
            .dialect
            .sql(&format!(
                "SELECT {USER_COLUMNS} FROM broker_user WHERE access_key_id = ?"
            ))
            .into_owned();
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(access_key_id.to_string())
            .fetch_optional(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(row.map(User::from))
    }

    async fn list_users(&mut self) -> Result<Vec<User>, StorageError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM broker_user ORDER BY username");
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .fetch_all(self.session.connection())
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    fn notify(&mut self, notification: ChangeNotification) {
        self.pending.push(notification);
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let pending = std::mem::take(&mut self.pending);
        for notification in &pending {
            if let Some(statement) = self.dialect.notify_statement(notification) {
                self.session
                    .connection()
                    .execute(statement.as_str())
                    .await
                    .map_err(StorageError::from_sqlx)?;
            }
        }
        let SqlTransaction {
            session,
            notifications,
            ..
        } = *self;
        session.commit().await?;
        for notification in pending {
            let _ = notifications.send(notification);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.session.rollback().await
    }
}
