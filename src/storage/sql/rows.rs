//! Row <-> record mapping shared by both SQL dialects.
//!
//! Timestamps are stored as epoch milliseconds, unsigned config values as
//! signed 64-bit integers, attribute and tag maps as JSON text, and booleans
//! as 0/1 integers so the same rows decode identically on SQLite and Postgres.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::StorageError;
use crate::queue::{DeadLetterTarget, Queue, QueueConfig};
use crate::storage::StoredMessage;
use crate::topic::{Subscription, SubscriptionProtocol, Topic};
use crate::user::User;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn to_millis_opt(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_millis)
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::InvalidRow(format!("timestamp {ms} out of range")))
}

fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StorageError> {
    ms.map(from_millis).transpose()
}

pub(crate) fn to_i64(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

fn to_u64(value: Option<i64>, column: &str) -> Result<Option<u64>, StorageError> {
    value
        .map(|v| {
            u64::try_from(v)
                .map_err(|_| StorageError::InvalidRow(format!("negative value in {column}")))
        })
        .transpose()
}

fn to_u32(value: i64, column: &str) -> Result<u32, StorageError> {
    u32::try_from(value).map_err(|_| StorageError::InvalidRow(format!("{column} out of range")))
}

pub(crate) fn encode_map(map: &HashMap<String, String>) -> Result<String, StorageError> {
    Ok(serde_json::to_string(map)?)
}

fn decode_map(text: &str) -> Result<HashMap<String, String>, StorageError> {
    if text.is_empty() {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, FromRow)]
pub(crate) struct QueueRow {
    pub name: String,
    pub created_at: i64,
    pub last_modified_at: i64,
    pub expires_at: Option<i64>,
    pub paused: i64,
    pub delay_ms: Option<i64>,
    pub visibility_timeout_ms: Option<i64>,
    pub max_message_size: Option<i64>,
    pub message_retention_period_ms: Option<i64>,
    pub receive_message_wait_time_ms: Option<i64>,
    pub max_receive_count: Option<i64>,
    pub dead_letter_queue_name: Option<String>,
    pub dead_letter_topic_name: Option<String>,
    pub expires_ms: Option<i64>,
    pub nak_expire_behavior: String,
    pub tags: String,
}

impl TryFrom<QueueRow> for Queue {
    type Error = StorageError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let dead_letter = match (row.dead_letter_queue_name, row.dead_letter_topic_name) {
            (Some(queue), None) => Some(DeadLetterTarget::Queue(queue)),
            (None, Some(topic)) => Some(DeadLetterTarget::Topic(topic)),
            (None, None) => None,
            (Some(_), Some(_)) => {
                return Err(StorageError::InvalidRow(format!(
                    "queue {} has both a dead letter queue and topic",
                    row.name
                )))
            }
        };
        let config = QueueConfig {
            delay_ms: to_u64(row.delay_ms, "delay_ms")?,
            visibility_timeout_ms: to_u64(row.visibility_timeout_ms, "visibility_timeout_ms")?,
            max_message_size: to_u64(row.max_message_size, "max_message_size")?,
            message_retention_period_ms: to_u64(
                row.message_retention_period_ms,
                "message_retention_period_ms",
            )?,
            receive_message_wait_time_ms: to_u64(
                row.receive_message_wait_time_ms,
                "receive_message_wait_time_ms",
            )?,
            max_receive_count: row
                .max_receive_count
                .map(|v| to_u32(v, "max_receive_count"))
                .transpose()?,
            dead_letter,
            expires_ms: to_u64(row.expires_ms, "expires_ms")?,
            nak_expire_behavior: serde_json::from_str(&row.nak_expire_behavior)?,
            tags: decode_map(&row.tags)?,
        };
        Ok(Queue {
            name: row.name,
            config,
            paused: row.paused != 0,
            created_at: from_millis(row.created_at)?,
            last_modified_at: from_millis(row.last_modified_at)?,
            expires_at: from_millis_opt(row.expires_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub queue_name: String,
    pub body: Vec<u8>,
    pub attributes: String,
    pub priority: i64,
    pub sent_at: i64,
    pub order_by: i64,
    pub delay_until: Option<i64>,
    pub expires_at: Option<i64>,
    pub not_visible_until: Option<i64>,
    pub receipt_handle: Option<String>,
    pub receive_count: i64,
    pub first_received_at: Option<i64>,
    pub last_nak_reason: Option<String>,
    pub deduplication_id: Option<String>,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StorageError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(StoredMessage {
            id: row.id,
            queue_name: row.queue_name,
            sequence: row.seq,
            body: row.body,
            attributes: decode_map(&row.attributes)?,
            priority: row.priority,
            sent_at: from_millis(row.sent_at)?,
            order_by: from_millis(row.order_by)?,
            delay_until: from_millis_opt(row.delay_until)?,
            expires_at: from_millis_opt(row.expires_at)?,
            not_visible_until: from_millis_opt(row.not_visible_until)?,
            receipt_handle: row.receipt_handle,
            receive_count: to_u32(row.receive_count, "receive_count")?,
            first_received_at: from_millis_opt(row.first_received_at)?,
            last_nak_reason: row.last_nak_reason,
            deduplication_id: row.deduplication_id,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TopicRow {
    pub name: String,
    pub tags: String,
    pub created_at: i64,
    pub last_modified_at: i64,
}

impl TryFrom<TopicRow> for Topic {
    type Error = StorageError;

    fn try_from(row: TopicRow) -> Result<Self, Self::Error> {
        Ok(Topic {
            name: row.name,
            tags: decode_map(&row.tags)?,
            created_at: from_millis(row.created_at)?,
            last_modified_at: from_millis(row.last_modified_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: String,
    pub topic_name: String,
    pub protocol: String,
    pub queue_name: String,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StorageError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let protocol = SubscriptionProtocol::parse(&row.protocol).ok_or_else(|| {
            StorageError::InvalidRow(format!("unknown subscription protocol {}", row.protocol))
        })?;
        Ok(Subscription {
            id: row.id,
            topic_name: row.topic_name,
            protocol,
            queue_name: row.queue_name,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    pub id: String,
    pub username: String,
    pub password_hash: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            access_key_id: row.access_key_id,
            secret_access_key: row.secret_access_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NakExpireBehavior;

    fn queue_row() -> QueueRow {
        QueueRow {
            name: "orders".into(),
            created_at: 1_700_000_000_000,
            last_modified_at: 1_700_000_000_500,
            expires_at: None,
            paused: 1,
            delay_ms: Some(100),
            visibility_timeout_ms: None,
            max_message_size: Some(1024),
            message_retention_period_ms: None,
            receive_message_wait_time_ms: None,
            max_receive_count: Some(3),
            dead_letter_queue_name: Some("orders-dlq".into()),
            dead_letter_topic_name: None,
            expires_ms: None,
            nak_expire_behavior: r#"{"decrease_priority_by":5}"#.into(),
            tags: r#"{"team":"billing"}"#.into(),
        }
    }

    #[test]
    fn test_queue_row_mapping() {
        let queue = Queue::try_from(queue_row()).unwrap();
        assert!(queue.paused);
        assert_eq!(queue.config.delay_ms, Some(100));
        assert_eq!(
            queue.config.dead_letter,
            Some(DeadLetterTarget::Queue("orders-dlq".into()))
        );
        assert_eq!(queue.config.tags.get("team").map(String::as_str), Some("billing"));
        assert_eq!(
            queue.config.nak_expire_behavior,
            NakExpireBehavior::DecreasePriorityBy(5)
        );
        assert_eq!(to_millis(queue.created_at), 1_700_000_000_000);
    }

    #[test]
    fn test_queue_row_with_both_targets_rejected() {
        let mut row = queue_row();
        row.dead_letter_topic_name = Some("dlt".into());
        assert!(matches!(
            Queue::try_from(row),
            Err(StorageError::InvalidRow(_))
        ));
    }

    #[test]
    fn test_negative_config_rejected() {
        let mut row = queue_row();
        row.delay_ms = Some(-1);
        assert!(Queue::try_from(row).is_err());
    }

    #[test]
    fn test_empty_attribute_text_decodes_to_empty_map() {
        assert!(decode_map("").unwrap().is_empty());
        assert!(decode_map("{}").unwrap().is_empty());
        assert!(decode_map("not json").is_err());
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let row = SubscriptionRow {
            id: "s".into(),
            topic_name: "t".into(),
            protocol: "http".into(),
            queue_name: "q".into(),
        };
        assert!(Subscription::try_from(row).is_err());
    }
}
