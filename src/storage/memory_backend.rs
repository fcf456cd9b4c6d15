//! In-memory storage backend using DashMap.
//!
//! Records live in process memory and are lost on restart. Writes apply to the
//! maps immediately; every transaction keeps an undo journal so a rollback (or
//! a dropped, uncommitted transaction) restores the previous records.
//! Read-modify-write sequences on one queue are serialized by the store's
//! per-queue locks, not here.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::StorageError;
use crate::queue::{DeadLetterTarget, MessageCounts, MessageState, Queue};
use crate::topic::{Subscription, Topic};
use crate::user::User;

use super::backend::{
    delivery_order, ChangeNotification, MessageQuery, StorageBackend, StoredMessage, Transaction,
    NOTIFICATION_CHANNEL_CAPACITY,
};

#[derive(Default)]
struct MemoryState {
    queues: DashMap<String, Queue>,
    /// Messages keyed by queue name
    messages: DashMap<String, Vec<StoredMessage>>,
    topics: DashMap<String, Topic>,
    /// Subscriptions keyed by id, with their creation sequence
    subscriptions: DashMap<String, (i64, Subscription)>,
    /// Held across the duplicate check and insert of a subscription
    subscription_insert: Mutex<()>,
    /// Users keyed by username
    users: DashMap<String, User>,
    /// Access key id -> username
    access_keys: DashMap<String, String>,
    sequence: AtomicI64,
}

impl MemoryState {
    fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn take_subscriptions(&self, matches: impl Fn(&Subscription) -> bool) -> Vec<(i64, Subscription)> {
        let ids: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| matches(&entry.value().1))
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.subscriptions.remove(id).map(|(_, value)| value))
            .collect()
    }
}

/// Inverse of one applied write.
enum Undo {
    RemoveQueue(String),
    RestoreQueue(Queue),
    ReinsertQueue {
        queue: Queue,
        messages: Vec<StoredMessage>,
        subscriptions: Vec<(i64, Subscription)>,
    },
    RemoveMessage { queue_name: String, id: String },
    RestoreMessage(StoredMessage),
    ReinsertMessages(Vec<StoredMessage>),
    RemoveTopic(String),
    ReinsertTopic {
        topic: Topic,
        subscriptions: Vec<(i64, Subscription)>,
    },
    RemoveSubscription(String),
    ReinsertSubscription(i64, Subscription),
    RemoveUser(User),
}

impl Undo {
    fn apply(self, state: &MemoryState) {
        match self {
            Undo::RemoveQueue(name) => {
                state.queues.remove(&name);
                state.messages.remove(&name);
            }
            Undo::RestoreQueue(queue) => {
                state.queues.insert(queue.name.clone(), queue);
            }
            Undo::ReinsertQueue {
                queue,
                messages,
                subscriptions,
            } => {
                state.messages.insert(queue.name.clone(), messages);
                state.queues.insert(queue.name.clone(), queue);
                for (seq, subscription) in subscriptions {
                    state
                        .subscriptions
                        .insert(subscription.id.clone(), (seq, subscription));
                }
            }
            Undo::RemoveMessage { queue_name, id } => {
                if let Some(mut messages) = state.messages.get_mut(&queue_name) {
                    messages.retain(|m| m.id != id);
                }
            }
            Undo::RestoreMessage(message) => {
                let mut messages = state.messages.entry(message.queue_name.clone()).or_default();
                match messages.iter_mut().find(|m| m.id == message.id) {
                    Some(existing) => *existing = message,
                    None => messages.push(message),
                }
            }
            Undo::ReinsertMessages(restored) => {
                for message in restored {
                    state
                        .messages
                        .entry(message.queue_name.clone())
                        .or_default()
                        .push(message);
                }
            }
            Undo::RemoveTopic(name) => {
                state.topics.remove(&name);
            }
            Undo::ReinsertTopic {
                topic,
                subscriptions,
            } => {
                state.topics.insert(topic.name.clone(), topic);
                for (seq, subscription) in subscriptions {
                    state
                        .subscriptions
                        .insert(subscription.id.clone(), (seq, subscription));
                }
            }
            Undo::RemoveSubscription(id) => {
                state.subscriptions.remove(&id);
            }
            Undo::ReinsertSubscription(seq, subscription) => {
                state
                    .subscriptions
                    .insert(subscription.id.clone(), (seq, subscription));
            }
            Undo::RemoveUser(user) => {
                state.users.remove(&user.username);
                if let Some(key) = &user.access_key_id {
                    state.access_keys.remove(key);
                }
            }
        }
    }
}

/// In-memory storage backend.
pub struct MemoryBackend {
    state: Arc<MemoryState>,
    notifications: broadcast::Sender<ChangeNotification>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(MemoryState::default()),
            notifications,
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable(
                "memory backend is shut down".to_string(),
            ));
        }
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            notifications: self.notifications.clone(),
            undo: Vec::new(),
            pending: Vec::new(),
            finished: false,
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notifications.subscribe()
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        tracing::info!("Memory backend shut down");
    }
}

pub struct MemoryTransaction {
    state: Arc<MemoryState>,
    notifications: broadcast::Sender<ChangeNotification>,
    undo: Vec<Undo>,
    pending: Vec<ChangeNotification>,
    finished: bool,
}

impl MemoryTransaction {
    fn undo_all(&mut self) {
        while let Some(undo) = self.undo.pop() {
            undo.apply(&self.state);
        }
        self.pending.clear();
    }

    fn messages_where(
        &self,
        queue_name: &str,
        keep: impl Fn(&StoredMessage) -> bool,
    ) -> Vec<StoredMessage> {
        self.state
            .messages
            .get(queue_name)
            .map(|messages| messages.iter().filter(|m| keep(m)).cloned().collect())
            .unwrap_or_default()
    }

    fn remove_messages_where(
        &mut self,
        queue_name: &str,
        remove: impl Fn(&StoredMessage) -> bool,
    ) -> u64 {
        let removed: Vec<StoredMessage> = match self.state.messages.get_mut(queue_name) {
            Some(mut messages) => {
                let (removed, kept): (Vec<_>, Vec<_>) =
                    messages.drain(..).partition(|m| remove(m));
                *messages = kept;
                removed
            }
            None => Vec::new(),
        };
        let count = removed.len() as u64;
        if !removed.is_empty() {
            self.undo.push(Undo::ReinsertMessages(removed));
        }
        count
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn insert_queue(&mut self, queue: &Queue) -> Result<(), StorageError> {
        match self.state.queues.entry(queue.name.clone()) {
            Entry::Occupied(_) => Err(StorageError::Conflict(format!("queue {}", queue.name))),
            Entry::Vacant(entry) => {
                entry.insert(queue.clone());
                self.undo.push(Undo::RemoveQueue(queue.name.clone()));
                Ok(())
            }
        }
    }

    async fn update_queue(&mut self, queue: &Queue) -> Result<bool, StorageError> {
        match self.state.queues.get_mut(&queue.name) {
            Some(mut existing) => {
                let previous = std::mem::replace(&mut *existing, queue.clone());
                drop(existing);
                self.undo.push(Undo::RestoreQueue(previous));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_queue(&mut self, name: &str) -> Result<Option<Queue>, StorageError> {
        Ok(self.state.queues.get(name).map(|q| q.clone()))
    }

    async fn list_queues(&mut self) -> Result<Vec<Queue>, StorageError> {
        Ok(self.state.queues.iter().map(|q| q.value().clone()).collect())
    }

    async fn delete_queue(&mut self, name: &str) -> Result<bool, StorageError> {
        let Some((_, queue)) = self.state.queues.remove(name) else {
            return Ok(false);
        };
        let messages = self
            .state
            .messages
            .remove(name)
            .map(|(_, messages)| messages)
            .unwrap_or_default();
        let subscriptions = self.state.take_subscriptions(|s| s.queue_name == name);
        self.undo.push(Undo::ReinsertQueue {
            queue,
            messages,
            subscriptions,
        });
        Ok(true)
    }

    async fn find_queues_by_dead_letter(
        &mut self,
        target: &DeadLetterTarget,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .state
            .queues
            .iter()
            .filter(|q| q.config.dead_letter.as_ref() == Some(target))
            .map(|q| q.name.clone())
            .collect())
    }

    async fn insert_message(&mut self, message: &StoredMessage) -> Result<i64, StorageError> {
        let mut messages = self
            .state
            .messages
            .entry(message.queue_name.clone())
            .or_default();
        if messages.iter().any(|m| m.id == message.id) {
            return Err(StorageError::Conflict(format!("message {}", message.id)));
        }
        if let Some(dedup) = &message.deduplication_id {
            if messages
                .iter()
                .any(|m| m.deduplication_id.as_ref() == Some(dedup))
            {
                return Err(StorageError::Conflict(format!("deduplication id {dedup}")));
            }
        }
        let sequence = self.state.next_sequence();
        let mut stored = message.clone();
        stored.sequence = sequence;
        messages.push(stored);
        drop(messages);

        self.undo.push(Undo::RemoveMessage {
            queue_name: message.queue_name.clone(),
            id: message.id.clone(),
        });
        Ok(sequence)
    }

    async fn update_message(&mut self, message: &StoredMessage) -> Result<bool, StorageError> {
        let previous = match self.state.messages.get_mut(&message.queue_name) {
            Some(mut messages) => match messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => {
                    let sequence = existing.sequence;
                    let previous = std::mem::replace(existing, message.clone());
                    existing.sequence = sequence;
                    Some(previous)
                }
                None => None,
            },
            None => None,
        };
        match previous {
            Some(previous) => {
                self.undo.push(Undo::RestoreMessage(previous));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_message(
        &mut self,
        queue_name: &str,
        id: &str,
    ) -> Result<Option<StoredMessage>, StorageError> {
        Ok(self.messages_where(queue_name, |m| m.id == id).pop())
    }

    async fn find_message_by_receipt_handle(
        &mut self,
        queue_name: &str,
        receipt_handle: &str,
    ) -> Result<Option<StoredMessage>, StorageError> {
        Ok(self
            .messages_where(queue_name, |m| {
                m.receipt_handle.as_deref() == Some(receipt_handle)
            })
            .pop())
    }

    async fn find_message_by_deduplication_id(
        &mut self,
        queue_name: &str,
        deduplication_id: &str,
    ) -> Result<Option<StoredMessage>, StorageError> {
        Ok(self
            .messages_where(queue_name, |m| {
                m.deduplication_id.as_deref() == Some(deduplication_id)
            })
            .pop())
    }

    async fn query_messages(
        &mut self,
        queue_name: &str,
        query: &MessageQuery,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let mut messages = self.messages_where(queue_name, |m| query.matches(m));
        messages.sort_by(delivery_order);
        if let Some(limit) = query.limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    async fn find_expired_deliveries(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let mut messages = self.messages_where(queue_name, |m| m.is_delivery_expired(now));
        messages.sort_by(delivery_order);
        Ok(messages)
    }

    async fn count_messages(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageCounts, StorageError> {
        let mut counts = MessageCounts::default();
        if let Some(messages) = self.state.messages.get(queue_name) {
            for message in messages.iter() {
                match message.state(now) {
                    MessageState::Available => counts.visible += 1,
                    MessageState::Delayed => counts.delayed += 1,
                    MessageState::NotVisible => counts.not_visible += 1,
                    MessageState::Expired => {}
                }
            }
        }
        Ok(counts)
    }

    async fn delete_message(&mut self, queue_name: &str, id: &str) -> Result<bool, StorageError> {
        Ok(self.remove_messages_where(queue_name, |m| m.id == id) > 0)
    }

    async fn delete_expired_messages(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        Ok(self.remove_messages_where(queue_name, |m| {
            m.state(now) == MessageState::Expired
        }))
    }

    async fn purge_messages(&mut self, queue_name: &str) -> Result<u64, StorageError> {
        Ok(self.remove_messages_where(queue_name, |_| true))
    }

    async fn insert_topic(&mut self, topic: &Topic) -> Result<(), StorageError> {
        match self.state.topics.entry(topic.name.clone()) {
            Entry::Occupied(_) => Err(StorageError::Conflict(format!("topic {}", topic.name))),
            Entry::Vacant(entry) => {
                entry.insert(topic.clone());
                self.undo.push(Undo::RemoveTopic(topic.name.clone()));
                Ok(())
            }
        }
    }

    async fn find_topic(&mut self, name: &str) -> Result<Option<Topic>, StorageError> {
        Ok(self.state.topics.get(name).map(|t| t.clone()))
    }

    async fn list_topics(&mut self) -> Result<Vec<Topic>, StorageError> {
        Ok(self.state.topics.iter().map(|t| t.value().clone()).collect())
    }

    async fn delete_topic(&mut self, name: &str) -> Result<bool, StorageError> {
        let Some((_, topic)) = self.state.topics.remove(name) else {
            return Ok(false);
        };
        let subscriptions = self.state.take_subscriptions(|s| s.topic_name == name);
        self.undo.push(Undo::ReinsertTopic {
            topic,
            subscriptions,
        });
        Ok(true)
    }

    async fn insert_subscription(&mut self, subscription: &Subscription) -> Result<bool, StorageError> {
        let _insert = self
            .state
            .subscription_insert
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let exists = self.state.subscriptions.iter().any(|entry| {
            let existing = &entry.value().1;
            existing.topic_name == subscription.topic_name
                && existing.queue_name == subscription.queue_name
        });
        if exists {
            return Ok(false);
        }
        let seq = self.state.next_sequence();
        self.state
            .subscriptions
            .insert(subscription.id.clone(), (seq, subscription.clone()));
        self.undo
            .push(Undo::RemoveSubscription(subscription.id.clone()));
        Ok(true)
    }

    async fn find_subscription(
        &mut self,
        topic_name: &str,
        queue_name: &str,
    ) -> Result<Option<Subscription>, StorageError> {
        Ok(self
            .state
            .subscriptions
            .iter()
            .find(|entry| {
                let s = &entry.value().1;
                s.topic_name == topic_name && s.queue_name == queue_name
            })
            .map(|entry| entry.value().1.clone()))
    }

    async fn list_subscriptions(&mut self, topic_name: &str) -> Result<Vec<Subscription>, StorageError> {
        let mut subscriptions: Vec<(i64, Subscription)> = self
            .state
            .subscriptions
            .iter()
            .filter(|entry| entry.value().1.topic_name == topic_name)
            .map(|entry| entry.value().clone())
            .collect();
        subscriptions.sort_by_key(|(seq, _)| *seq);
        Ok(subscriptions.into_iter().map(|(_, s)| s).collect())
    }

    async fn delete_subscription(&mut self, id: &str) -> Result<bool, StorageError> {
        match self.state.subscriptions.remove(id) {
            Some((_, (seq, subscription))) => {
                self.undo.push(Undo::ReinsertSubscription(seq, subscription));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StorageError> {
        match self.state.users.entry(user.username.clone()) {
            Entry::Occupied(_) => {
                return Err(StorageError::Conflict(format!("username {}", user.username)))
            }
            Entry::Vacant(entry) => {
                entry.insert(user.clone());
            }
        }
        if let Some(key) = &user.access_key_id {
            match self.state.access_keys.entry(key.clone()) {
                Entry::Occupied(_) => {
                    self.state.users.remove(&user.username);
                    return Err(StorageError::Conflict(format!("access key id {key}")));
                }
                Entry::Vacant(entry) => {
                    entry.insert(user.username.clone());
                }
            }
        }
        self.undo.push(Undo::RemoveUser(user.clone()));
        Ok(())
    }

    async fn find_user_by_username(&mut self, username: &str) -> Result<Option<User>, StorageError> {
        Ok(self.state.users.get(username).map(|u| u.clone()))
    }

    async fn find_user_by_access_key_id(
        &mut self,
        access_key_id: &str,
    ) -> Result<Option<User>, StorageError> {
        let username = self
            .state
            .access_keys
            .get(access_key_id)
            .map(|u| u.value().clone());
        Ok(username.and_then(|username| self.state.users.get(&username).map(|u| u.clone())))
    }

    async fn list_users(&mut self) -> Result<Vec<User>, StorageError> {
        Ok(self.state.users.iter().map(|u| u.value().clone()).collect())
    }

    fn notify(&mut self, notification: ChangeNotification) {
        self.pending.push(notification);
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.undo.clear();
        for notification in self.pending.drain(..) {
            // No receivers is fine: nobody is waiting.
            let _ = self.notifications.send(notification);
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.undo_all();
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::queue::QueueConfig;
    use crate::topic::SubscriptionProtocol;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn create_test_message(queue_name: &str, id: &str) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            queue_name: queue_name.to_string(),
            sequence: 0,
            body: b"hello".to_vec(),
            attributes: HashMap::new(),
            priority: 0,
            sent_at: now(),
            order_by: now(),
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

    async fn create_backend_with_queue(name: &str) -> MemoryBackend {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.insert_queue(&Queue::new(name.to_string(), QueueConfig::default(), now()))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_commit_persists_and_notifies() {
        let backend = create_backend_with_queue("orders").await;
        let mut notifications = backend.subscribe();

        let mut tx = backend.begin().await.unwrap();
        let seq = tx
            .insert_message(&create_test_message("orders", "m1"))
            .await
            .unwrap();
        assert!(seq > 0);
        tx.notify(ChangeNotification::new_message("orders"));
        assert!(notifications.try_recv().is_err());
        tx.commit().await.unwrap();

        assert_eq!(
            notifications.try_recv().unwrap(),
            ChangeNotification::new_message("orders")
        );
        let mut tx = backend.begin().await.unwrap();
        let found = tx.find_message("orders", "m1").await.unwrap().unwrap();
        assert_eq!(found.sequence, seq);
    }

    #[tokio::test]
    async fn test_rollback_restores_records() {
        let backend = create_backend_with_queue("orders").await;
        let mut notifications = backend.subscribe();

        let mut tx = backend.begin().await.unwrap();
        tx.insert_message(&create_test_message("orders", "keep"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        tx.insert_message(&create_test_message("orders", "discard"))
            .await
            .unwrap();
        let mut keep = tx.find_message("orders", "keep").await.unwrap().unwrap();
        keep.priority = 9;
        assert!(tx.update_message(&keep).await.unwrap());
        assert!(tx.delete_queue("orders").await.unwrap());
        tx.notify(ChangeNotification::resume("orders"));
        tx.rollback().await.unwrap();

        assert!(notifications.try_recv().is_err());
        let mut tx = backend.begin().await.unwrap();
        assert!(tx.find_queue("orders").await.unwrap().is_some());
        assert!(tx.find_message("orders", "discard").await.unwrap().is_none());
        let keep = tx.find_message("orders", "keep").await.unwrap().unwrap();
        assert_eq!(keep.priority, 0);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let backend = MemoryBackend::new();
        {
            let mut tx = backend.begin().await.unwrap();
            tx.insert_queue(&Queue::new("temp".into(), QueueConfig::default(), now()))
                .await
                .unwrap();
        }
        let mut tx = backend.begin().await.unwrap();
        assert!(tx.find_queue("temp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deduplication_conflict() {
        let backend = create_backend_with_queue("orders").await;
        let mut first = create_test_message("orders", "m1");
        first.deduplication_id = Some("dedup".into());
        let mut second = create_test_message("orders", "m2");
        second.deduplication_id = Some("dedup".into());

        let mut tx = backend.begin().await.unwrap();
        tx.insert_message(&first).await.unwrap();
        let err = tx.insert_message(&second).await.unwrap_err();
        assert!(err.is_conflict());

        assert!(tx.delete_message("orders", "m1").await.unwrap());
        tx.insert_message(&second).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_orders_and_limits() {
        let backend = create_backend_with_queue("orders").await;
        let mut tx = backend.begin().await.unwrap();
        for (id, priority) in [("a", 1), ("b", 5), ("c", 5)] {
            let mut message = create_test_message("orders", id);
            message.priority = priority;
            tx.insert_message(&message).await.unwrap();
        }
        let mut delayed = create_test_message("orders", "d");
        delayed.priority = 10;
        delayed.delay_until = Some(now() + chrono::Duration::seconds(1));
        tx.insert_message(&delayed).await.unwrap();

        let found = tx
            .query_messages("orders", &MessageQuery::available(now(), 2))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let counts = tx.count_messages("orders", now()).await.unwrap();
        assert_eq!(counts.visible, 3);
        assert_eq!(counts.delayed, 1);
    }

    #[tokio::test]
    async fn test_subscription_uniqueness_and_cascade() {
        let backend = create_backend_with_queue("orders").await;
        let mut tx = backend.begin().await.unwrap();
        tx.insert_topic(&Topic {
            name: "events".into(),
            tags: HashMap::new(),
            created_at: now(),
            last_modified_at: now(),
        })
        .await
        .unwrap();

        let subscription = Subscription {
            id: "s1".into(),
            topic_name: "events".into(),
            protocol: SubscriptionProtocol::Queue,
            queue_name: "orders".into(),
        };
        assert!(tx.insert_subscription(&subscription).await.unwrap());
        let duplicate = Subscription {
            id: "s2".into(),
            ..subscription.clone()
        };
        assert!(!tx.insert_subscription(&duplicate).await.unwrap());

        assert!(tx.delete_queue("orders").await.unwrap());
        assert!(tx.list_subscriptions("events").await.unwrap().is_empty());
        tx.commit().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscriptions_insert_once() {
        let backend = Arc::new(create_backend_with_queue("orders").await);
        let mut tx = backend.begin().await.unwrap();
        tx.insert_topic(&Topic {
            name: "events".into(),
            tags: HashMap::new(),
            created_at: now(),
            last_modified_at: now(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let mut tx = backend.begin().await.unwrap();
                let inserted = tx
                    .insert_subscription(&Subscription {
                        id: format!("s{i}"),
                        topic_name: "events".into(),
                        protocol: SubscriptionProtocol::Queue,
                        queue_name: "orders".into(),
                    })
                    .await
                    .unwrap();
                tx.commit().await.unwrap();
                inserted
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);

        let mut tx = backend.begin().await.unwrap();
        assert_eq!(tx.list_subscriptions("events").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_user_uniqueness_domains() {
        let backend = MemoryBackend::new();
        let user = User {
            id: "u1".into(),
            username: "alice".into(),
            password_hash: None,
            access_key_id: Some("AKIA1".into()),
            secret_access_key: Some("secret".into()),
        };
        let mut tx = backend.begin().await.unwrap();
        tx.insert_user(&user).await.unwrap();

        let same_key = User {
            id: "u2".into(),
            username: "bob".into(),
            ..user.clone()
        };
        assert!(tx.insert_user(&same_key).await.unwrap_err().is_conflict());
        assert!(tx.find_user_by_username("bob").await.unwrap().is_none());

        let found = tx.find_user_by_access_key_id("AKIA1").await.unwrap().unwrap();
        assert_eq!(found.username, "alice");
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_after_shutdown_fails() {
        let backend = MemoryBackend::new();
        backend.shutdown().await;
        assert!(matches!(
            backend.begin().await,
            Err(StorageError::Unavailable(_))
        ));
    }
}
