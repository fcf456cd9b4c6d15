use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::deadline_after;
use crate::error::{BrokerError, Result};

/// Batch bound for receive and peek when the caller does not pass one.
pub const DEFAULT_MAX_NUMBER_OF_MESSAGES: usize = 10;

/// Visibility timeout when neither the call nor the queue sets one.
pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;

const MAX_NAME_LENGTH: usize = 256;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

/// Trim and validate a queue or topic name.
pub(crate) fn normalize_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_NAME_LENGTH || !trimmed.chars().all(is_name_char) {
        return None;
    }
    Some(trimmed.to_string())
}

pub(crate) fn validate_queue_name(name: &str) -> Result<String> {
    normalize_name(name).ok_or_else(|| BrokerError::InvalidQueueName(name.to_string()))
}

/// Where messages go once they exceed the max receive count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum DeadLetterTarget {
    Queue(String),
    Topic(String),
}

impl DeadLetterTarget {
    pub fn queue_name(&self) -> Option<&str> {
        match self {
            DeadLetterTarget::Queue(name) => Some(name),
            DeadLetterTarget::Topic(_) => None,
        }
    }

    pub fn topic_name(&self) -> Option<&str> {
        match self {
            DeadLetterTarget::Topic(name) => Some(name),
            DeadLetterTarget::Queue(_) => None,
        }
    }
}

/// What happens to a message's place in line when a delivery ends without
/// an ack (nak or visibility timeout).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NakExpireBehavior {
    /// Keep priority and position
    #[default]
    Retry,
    /// Order after every message of equal priority, as if sent now
    MoveToEnd,
    /// Lower the priority by the given amount
    DecreasePriorityBy(u32),
}

/// Queue configuration, used both to create and to update a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Default delivery delay applied to every send
    pub delay_ms: Option<u64>,
    /// Default visibility timeout for receives
    pub visibility_timeout_ms: Option<u64>,
    /// Largest accepted body, in bytes
    pub max_message_size: Option<u64>,
    /// How long a message survives before it is silently purged
    pub message_retention_period_ms: Option<u64>,
    /// Default long-poll wait for receives
    pub receive_message_wait_time_ms: Option<u64>,
    /// Deliveries allowed before dead-lettering
    pub max_receive_count: Option<u32>,
    pub dead_letter: Option<DeadLetterTarget>,
    /// Queue TTL, refreshed on every receive/peek
    pub expires_ms: Option<u64>,
    pub nak_expire_behavior: NakExpireBehavior,
    pub tags: HashMap<String, String>,
}

impl QueueConfig {
    pub fn with_dead_letter_queue(mut self, name: impl Into<String>, max_receive_count: u32) -> Self {
        self.dead_letter = Some(DeadLetterTarget::Queue(name.into()));
        self.max_receive_count = Some(max_receive_count);
        self
    }

    pub fn with_dead_letter_topic(mut self, name: impl Into<String>, max_receive_count: u32) -> Self {
        self.dead_letter = Some(DeadLetterTarget::Topic(name.into()));
        self.max_receive_count = Some(max_receive_count);
        self
    }

    /// Structural checks that do not need storage access.
    pub(crate) fn validate(&self, queue_name: &str) -> Result<()> {
        if let Some(target) = &self.dead_letter {
            if self.max_receive_count.is_none() {
                return Err(BrokerError::InvalidQueueConfig(
                    "a dead letter target requires max_receive_count".to_string(),
                ));
            }
            if target.queue_name() == Some(queue_name) {
                return Err(BrokerError::InvalidQueueConfig(format!(
                    "queue \"{queue_name}\" cannot be its own dead letter queue"
                )));
            }
        }
        if self.max_message_size == Some(0) {
            return Err(BrokerError::InvalidQueueConfig(
                "max_message_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A queue record as persisted by the storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub config: QueueConfig,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    /// TTL expiry, only set when `config.expires_ms` is
    pub expires_at: Option<DateTime<Utc>>,
}

impl Queue {
    pub fn new(name: String, config: QueueConfig, now: DateTime<Utc>) -> Self {
        let expires_at = config.expires_ms.map(|ms| deadline_after(now, ms));
        Self {
            name,
            config,
            paused: false,
            created_at: now,
            last_modified_at: now,
            expires_at,
        }
    }

    /// Push the TTL expiry forward. Returns false when the queue has no TTL.
    pub fn touch(&mut self, now: DateTime<Utc>) -> bool {
        match self.config.expires_ms {
            Some(ms) => {
                self.expires_at = Some(deadline_after(now, ms));
                true
            }
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    pub fn visibility_timeout_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .or(self.config.visibility_timeout_ms)
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_MS)
    }

    pub fn wait_time_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .or(self.config.receive_message_wait_time_ms)
            .unwrap_or(0)
    }

    /// Effective delay: the larger of the per-call delay and the queue default.
    pub fn delay_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(0)
            .max(self.config.delay_ms.unwrap_or(0))
    }

    pub fn check_message_size(&self, size: usize) -> Result<()> {
        match self.config.max_message_size {
            Some(max) if size as u64 > max => {
                Err(BrokerError::MessageExceededMaxMessageSize { size, max })
            }
            _ => Ok(()),
        }
    }

    /// The dead-letter target, if a message with `receive_count` deliveries must be routed.
    pub fn dead_letter_for(&self, receive_count: u32) -> Option<&DeadLetterTarget> {
        let max = self.config.max_receive_count?;
        let target = self.config.dead_letter.as_ref()?;
        (receive_count > max).then_some(target)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub visible: u64,
    pub delayed: u64,
    pub not_visible: u64,
}

impl MessageCounts {
    pub fn total(&self) -> u64 {
        self.visible + self.delayed + self.not_visible
    }
}

/// Snapshot of a queue for listing and gauges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    #[serde(flatten)]
    pub config: QueueConfig,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub number_of_messages: u64,
    pub number_of_messages_visible: u64,
    pub number_of_messages_delayed: u64,
    pub number_of_messages_not_visible: u64,
}

impl QueueInfo {
    pub fn new(queue: Queue, counts: MessageCounts) -> Self {
        Self {
            name: queue.name,
            config: queue.config,
            paused: queue.paused,
            created_at: queue.created_at,
            last_modified_at: queue.last_modified_at,
            expires_at: queue.expires_at,
            number_of_messages: counts.total(),
            number_of_messages_visible: counts.visible,
            number_of_messages_delayed: counts.delayed,
            number_of_messages_not_visible: counts.not_visible,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_name_validation() {
        assert_eq!(normalize_name("  orders  "), Some("orders".to_string()));
        assert_eq!(normalize_name("orders.v2:dlq-1_a"), Some("orders.v2:dlq-1_a".to_string()));
        assert_eq!(normalize_name("   "), None);
        assert_eq!(normalize_name("has space"), None);
        assert_eq!(normalize_name("quote'd"), None);
        assert_eq!(normalize_name(&"a".repeat(257)), None);
    }

    #[test]
    fn test_config_validation() {
        let config = QueueConfig::default().with_dead_letter_queue("dlq", 3);
        assert!(config.validate("orders").is_ok());
        assert!(matches!(
            config.validate("dlq"),
            Err(BrokerError::InvalidQueueConfig(_))
        ));

        let config = QueueConfig {
            dead_letter: Some(DeadLetterTarget::Topic("dlt".into())),
            ..Default::default()
        };
        assert!(matches!(
            config.validate("orders"),
            Err(BrokerError::InvalidQueueConfig(_))
        ));
    }

    #[test]
    fn test_dead_letter_threshold() {
        let queue = Queue::new(
            "orders".into(),
            QueueConfig::default().with_dead_letter_queue("dlq", 2),
            now(),
        );
        assert!(queue.dead_letter_for(2).is_none());
        assert_eq!(
            queue.dead_letter_for(3),
            Some(&DeadLetterTarget::Queue("dlq".into()))
        );

        let plain = Queue::new("plain".into(), QueueConfig::default(), now());
        assert!(plain.dead_letter_for(100).is_none());
    }

    #[test]
    fn test_effective_delay_uses_larger_value() {
        let queue = Queue::new(
            "orders".into(),
            QueueConfig {
                delay_ms: Some(500),
                ..Default::default()
            },
            now(),
        );
        assert_eq!(queue.delay_ms(None), 500);
        assert_eq!(queue.delay_ms(Some(100)), 500);
        assert_eq!(queue.delay_ms(Some(2_000)), 2_000);
    }

    #[test]
    fn test_touch_and_expiry() {
        let mut queue = Queue::new(
            "temp".into(),
            QueueConfig {
                expires_ms: Some(1_000),
                ..Default::default()
            },
            now(),
        );
        assert!(!queue.is_expired(now() + chrono::Duration::milliseconds(1_000)));
        assert!(queue.is_expired(now() + chrono::Duration::milliseconds(1_001)));

        assert!(queue.touch(now() + chrono::Duration::milliseconds(900)));
        assert!(!queue.is_expired(now() + chrono::Duration::milliseconds(1_500)));

        let mut plain = Queue::new("plain".into(), QueueConfig::default(), now());
        assert!(!plain.touch(now()));
        assert!(!plain.is_expired(now() + chrono::Duration::days(365)));
    }

    #[test]
    fn test_nak_expire_behavior_serde() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"nak_expire_behavior":{"decrease_priority_by":10}}"#).unwrap();
        assert_eq!(config.nak_expire_behavior, NakExpireBehavior::DecreasePriorityBy(10));

        let config: QueueConfig = serde_json::from_str(r#"{"nak_expire_behavior":"move_to_end"}"#).unwrap();
        assert_eq!(config.nak_expire_behavior, NakExpireBehavior::MoveToEnd);
        assert_eq!(QueueConfig::default().nak_expire_behavior, NakExpireBehavior::Retry);
    }

    #[test]
    fn test_message_size_check() {
        let queue = Queue::new(
            "small".into(),
            QueueConfig {
                max_message_size: Some(5),
                ..Default::default()
            },
            now(),
        );
        assert!(queue.check_message_size(5).is_ok());
        assert!(matches!(
            queue.check_message_size(6),
            Err(BrokerError::MessageExceededMaxMessageSize { size: 6, max: 5 })
        ));
    }
}
