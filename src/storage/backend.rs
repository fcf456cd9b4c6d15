//! Backend trait for broker storage.
//!
//! This module defines the record-level contract every storage engine
//! implements. The message lifecycle rules live in [`crate::queue`] and
//! [`crate::topic`] and only talk to storage through a [`Transaction`], so the
//! same state machine runs unchanged on every backend.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::StorageError;
use crate::queue::{DeadLetterTarget, Message, MessageCounts, MessageState, Queue};
use crate::topic::{Subscription, Topic};
use crate::user::User;

/// A message as stored by a backend.
///
/// Unlike [`Message`], this carries the bookkeeping columns the engine needs:
/// owning queue, insertion sequence, visibility deadline and deduplication id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Unique within the queue
    pub id: String,

    pub queue_name: String,

    /// Insertion sequence assigned by the backend on insert
    pub sequence: i64,

    pub body: Vec<u8>,

    pub attributes: HashMap<String, String>,

    pub priority: i64,

    pub sent_at: DateTime<Utc>,

    /// Secondary ordering key (after priority)
    pub order_by: DateTime<Utc>,

    pub delay_until: Option<DateTime<Utc>>,

    /// Retention deadline
    pub expires_at: Option<DateTime<Utc>>,

    /// Set together with `receipt_handle` while a delivery is outstanding
    pub not_visible_until: Option<DateTime<Utc>>,

    pub receipt_handle: Option<String>,

    pub receive_count: u32,

    pub first_received_at: Option<DateTime<Utc>>,

    pub last_nak_reason: Option<String>,

    pub deduplication_id: Option<String>,
}

impl StoredMessage {
    /// Derive the delivery state at `now`.
    ///
    /// A delivery whose deadline has passed reads as available (or delayed)
    /// even before the engine resolves it, so counts never lag the clock.
    pub fn state(&self, now: DateTime<Utc>) -> MessageState {
        if self.expires_at.is_some_and(|at| at < now) {
            MessageState::Expired
        } else if self.is_not_visible(now) {
            MessageState::NotVisible
        } else if self.delay_until.is_some_and(|at| at > now) {
            MessageState::Delayed
        } else {
            MessageState::Available
        }
    }

    pub fn is_not_visible(&self, now: DateTime<Utc>) -> bool {
        self.receipt_handle.is_some() && self.not_visible_until.is_some_and(|at| at > now)
    }

    /// Outstanding delivery whose visibility deadline has been reached.
    pub fn is_delivery_expired(&self, now: DateTime<Utc>) -> bool {
        self.receipt_handle.is_some() && self.not_visible_until.is_none_or(|at| at <= now)
    }

    /// The current receipt handle, if the delivery is still outstanding.
    pub fn active_receipt_handle(&self, now: DateTime<Utc>) -> Option<&str> {
        if self.is_not_visible(now) {
            self.receipt_handle.as_deref()
        } else {
            None
        }
    }

    pub fn clear_delivery(&mut self) {
        self.receipt_handle = None;
        self.not_visible_until = None;
    }

    pub fn to_message(&self, now: DateTime<Utc>) -> Message {
        let state = self.state(now);
        let outstanding = state == MessageState::NotVisible;
        Message {
            id: self.id.clone(),
            body: self.body.clone(),
            attributes: self.attributes.clone(),
            priority: self.priority,
            sent_at: self.sent_at,
            delay_until: self.delay_until,
            expires_at: self.expires_at,
            receive_count: self.receive_count,
            first_received_at: self.first_received_at,
            last_nak_reason: self.last_nak_reason.clone(),
            receipt_handle: outstanding.then(|| self.receipt_handle.clone()).flatten(),
            not_visible_until: outstanding.then_some(self.not_visible_until).flatten(),
            state,
        }
    }
}

/// Delivery order: priority descending, then `order_by`, then insertion sequence.
pub fn delivery_order(a: &StoredMessage, b: &StoredMessage) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.order_by.cmp(&b.order_by))
        .then_with(|| a.sequence.cmp(&b.sequence))
}

/// Filter for [`Transaction::query_messages`]. Retention-expired messages are always excluded.
#[derive(Debug, Clone, Copy)]
pub struct MessageQuery {
    pub now: DateTime<Utc>,
    pub include_delayed: bool,
    pub include_not_visible: bool,
    pub limit: Option<usize>,
}

impl MessageQuery {
    /// Messages a receive may hand out.
    pub fn available(now: DateTime<Utc>, limit: usize) -> Self {
        Self {
            now,
            include_delayed: false,
            include_not_visible: false,
            limit: Some(limit),
        }
    }

    pub fn matches(&self, message: &StoredMessage) -> bool {
        match message.state(self.now) {
            MessageState::Expired => false,
            MessageState::Available => true,
            MessageState::Delayed => self.include_delayed,
            MessageState::NotVisible => self.include_not_visible,
        }
    }
}

/// What a change notification announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A message became receivable (sent, or returned by nak/timeout)
    NewMessage,
    /// Waiters should re-check (queue resumed, delay elapsed, queue deleted)
    Resume,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::NewMessage => "new_message",
            ChangeKind::Resume => "resume",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new_message" => Some(ChangeKind::NewMessage),
            "resume" => Some(ChangeKind::Resume),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub queue_name: String,
    pub kind: ChangeKind,
}

impl ChangeNotification {
    pub fn new_message(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            kind: ChangeKind::NewMessage,
        }
    }

    pub fn resume(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            kind: ChangeKind::Resume,
        }
    }
}

/// Capacity of every backend's notification channel.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

/// Backend trait for broker storage.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (`Send + Sync`) as they are shared by
/// every store operation and background task.
///
/// # Notifications
///
/// Notifications queued on a transaction with [`Transaction::notify`] are
/// published on [`StorageBackend::subscribe`] after a successful commit and
/// discarded on rollback.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend identifier for logging ("memory", "sqlite", "postgres").
    fn name(&self) -> &'static str;

    /// Create the schema if needed. Safe to call repeatedly.
    async fn migrate(&self) -> Result<(), StorageError>;

    /// Start a transaction.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` after [`StorageBackend::shutdown`],
    /// or a database error if the connection cannot be acquired.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;

    /// Subscribe to committed change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification>;

    /// Release connections. Further calls to `begin` fail.
    async fn shutdown(&self);
}

/// A unit of atomic work against a backend.
///
/// Dropping a transaction without calling [`Transaction::commit`] rolls it back.
#[async_trait]
pub trait Transaction: Send {
    // Queues

    /// Insert a new queue.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if a queue with the same name exists.
    async fn insert_queue(&mut self, queue: &Queue) -> Result<(), StorageError>;

    /// Overwrite an existing queue. Returns false if it does not exist.
    async fn update_queue(&mut self, queue: &Queue) -> Result<bool, StorageError>;

    async fn find_queue(&mut self, name: &str) -> Result<Option<Queue>, StorageError>;

    async fn list_queues(&mut self) -> Result<Vec<Queue>, StorageError>;

    /// Delete a queue together with its messages and subscriptions.
    async fn delete_queue(&mut self, name: &str) -> Result<bool, StorageError>;

    /// Names of queues whose dead-letter target is `target`.
    async fn find_queues_by_dead_letter(
        &mut self,
        target: &DeadLetterTarget,
    ) -> Result<Vec<String>, StorageError>;

    // Messages

    /// Insert a message and return the sequence the backend assigned.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the id, or the deduplication id,
    /// is already present in the queue.
    async fn insert_message(&mut self, message: &StoredMessage) -> Result<i64, StorageError>;

    /// Overwrite a message's mutable columns. Returns false if it no longer exists.
    async fn update_message(&mut self, message: &StoredMessage) -> Result<bool, StorageError>;

    async fn find_message(
        &mut self,
        queue_name: &str,
        id: &str,
    ) -> Result<Option<StoredMessage>, StorageError>;

    async fn find_message_by_receipt_handle(
        &mut self,
        queue_name: &str,
        receipt_handle: &str,
    ) -> Result<Option<StoredMessage>, StorageError>;

    /// The message holding `deduplication_id` in the queue, expired or not.
    async fn find_message_by_deduplication_id(
        &mut self,
        queue_name: &str,
        deduplication_id: &str,
    ) -> Result<Option<StoredMessage>, StorageError>;

    /// Messages matching `query`, in [`delivery_order`].
    async fn query_messages(
        &mut self,
        queue_name: &str,
        query: &MessageQuery,
    ) -> Result<Vec<StoredMessage>, StorageError>;

    /// Outstanding deliveries whose visibility deadline is at or before `now`.
    async fn find_expired_deliveries(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>, StorageError>;

    async fn count_messages(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageCounts, StorageError>;

    async fn delete_message(&mut self, queue_name: &str, id: &str) -> Result<bool, StorageError>;

    /// Remove messages whose retention deadline is before `now`.
    async fn delete_expired_messages(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    async fn purge_messages(&mut self, queue_name: &str) -> Result<u64, StorageError>;

    // Topics

    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if a topic with the same name exists.
    async fn insert_topic(&mut self, topic: &Topic) -> Result<(), StorageError>;

    async fn find_topic(&mut self, name: &str) -> Result<Option<Topic>, StorageError>;

    async fn list_topics(&mut self) -> Result<Vec<Topic>, StorageError>;

    /// Delete a topic together with its subscriptions.
    async fn delete_topic(&mut self, name: &str) -> Result<bool, StorageError>;

    /// Insert a subscription. Returns false, without writing, when the queue
    /// is already subscribed to the topic.
    async fn insert_subscription(&mut self, subscription: &Subscription) -> Result<bool, StorageError>;

    async fn find_subscription(
        &mut self,
        topic_name: &str,
        queue_name: &str,
    ) -> Result<Option<Subscription>, StorageError>;

    /// Subscriptions of a topic in creation order.
    async fn list_subscriptions(&mut self, topic_name: &str) -> Result<Vec<Subscription>, StorageError>;

    async fn delete_subscription(&mut self, id: &str) -> Result<bool, StorageError>;

    // Users

    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the username or access key id is taken.
    async fn insert_user(&mut self, user: &User) -> Result<(), StorageError>;

    async fn find_user_by_username(&mut self, username: &str) -> Result<Option<User>, StorageError>;

    async fn find_user_by_access_key_id(
        &mut self,
        access_key_id: &str,
    ) -> Result<Option<User>, StorageError>;

    async fn list_users(&mut self) -> Result<Vec<User>, StorageError>;

    // Lifecycle

    /// Queue a notification to publish once this transaction commits.
    fn notify(&mut self, notification: ChangeNotification);

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    fn message(id: &str, priority: i64, order_by: i64, sequence: i64) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            queue_name: "q".to_string(),
            sequence,
            body: b"body".to_vec(),
            attributes: HashMap::new(),
            priority,
            sent_at: at(order_by),
            order_by: at(order_by),
            delay_until: None,
            expires_at: None,
            not_visible_until: None,
            receipt_handle: None,
            receive_count: 0,
            first_received_at: None,
            last_nak_reason: None,
            deduplication_id: None,
        }
    }

    #[test]
    fn test_state_derivation() {
        let mut m = message("a", 0, 0, 1);
        assert_eq!(m.state(at(0)), MessageState::Available);

        m.delay_until = Some(at(100));
        assert_eq!(m.state(at(99)), MessageState::Delayed);
        assert_eq!(m.state(at(100)), MessageState::Available);

        m.receipt_handle = Some("h".into());
        m.not_visible_until = Some(at(500));
        assert_eq!(m.state(at(499)), MessageState::NotVisible);
        assert_eq!(m.state(at(500)), MessageState::Available);
        assert!(m.is_delivery_expired(at(500)));
        assert_eq!(m.active_receipt_handle(at(499)), Some("h"));
        assert_eq!(m.active_receipt_handle(at(500)), None);

        m.expires_at = Some(at(1_000));
        assert_eq!(m.state(at(1_000)), MessageState::Available);
        assert_eq!(m.state(at(1_001)), MessageState::Expired);
    }

    #[test]
    fn test_receipt_handle_hidden_when_visible() {
        let mut m = message("a", 0, 0, 1);
        m.receipt_handle = Some("h".into());
        m.not_visible_until = Some(at(10));

        assert_eq!(m.to_message(at(5)).receipt_handle.as_deref(), Some("h"));
        assert_eq!(m.to_message(at(10)).receipt_handle, None);
    }

    #[test]
    fn test_delivery_order() {
        let mut messages = vec![
            message("low-early", 1, 0, 1),
            message("high-late", 5, 10, 2),
            message("high-early", 5, 5, 3),
            message("high-early-second", 5, 5, 4),
        ];
        messages.sort_by(delivery_order);
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["high-early", "high-early-second", "high-late", "low-early"]
        );
    }

    #[test]
    fn test_query_filters() {
        let mut delayed = message("d", 0, 0, 1);
        delayed.delay_until = Some(at(100));

        let query = MessageQuery::available(at(0), 10);
        assert!(!query.matches(&delayed));

        let query = MessageQuery {
            include_delayed: true,
            ..query
        };
        assert!(query.matches(&delayed));
    }

    #[test]
    fn test_change_kind_round_trip() {
        for kind in [ChangeKind::NewMessage, ChangeKind::Resume] {
            assert_eq!(ChangeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChangeKind::parse("other"), None);
    }
}
