//! Message lifecycle engine.
//!
//! A [`QueueEngine`] applies the delivery state machine to the records of one
//! open [`Transaction`]. It never commits: the caller decides whether the
//! work lands, and after a commit schedules the wake-ups the engine collected
//! (visibility deadlines and delivery delays).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::deadline_after;
use crate::error::{BrokerError, Result, StorageError};
use crate::storage::{ChangeNotification, MessageQuery, StoredMessage, Transaction};
use crate::topic::TopicEngine;

use super::message::{
    Message, PeekMessagesOptions, SendMessageOptions, SendMessageResult, UpdateMessageOptions,
};
use super::models::{
    DeadLetterTarget, MessageCounts, NakExpireBehavior, Queue, DEFAULT_MAX_NUMBER_OF_MESSAGES,
};

/// A point in time at which a queue must be re-examined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledWake {
    pub queue_name: String,
    pub at: DateTime<Utc>,
}

/// Where a released delivery ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Available,
    DeadLettered,
}

/// Work done by [`QueueEngine::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Messages removed because their retention period elapsed
    pub purged: u64,
    /// Expired deliveries returned to the queue
    pub returned: usize,
    pub dead_lettered: usize,
}

impl SweepResult {
    pub fn is_empty(&self) -> bool {
        self.purged == 0 && self.returned == 0 && self.dead_lettered == 0
    }
}

pub struct QueueEngine<'t> {
    tx: &'t mut dyn Transaction,
    now: DateTime<Utc>,
    wakes: Vec<ScheduledWake>,
}

impl<'t> QueueEngine<'t> {
    pub fn new(tx: &'t mut dyn Transaction, now: DateTime<Utc>) -> Self {
        Self {
            tx,
            now,
            wakes: Vec::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn transaction(&mut self) -> &mut dyn Transaction {
        &mut *self.tx
    }

    /// Wake-ups collected so far, to be scheduled once the transaction commits.
    pub fn take_wakes(&mut self) -> Vec<ScheduledWake> {
        std::mem::take(&mut self.wakes)
    }

    fn schedule(&mut self, queue_name: &str, at: DateTime<Utc>) {
        self.wakes.push(ScheduledWake {
            queue_name: queue_name.to_string(),
            at,
        });
    }

    pub async fn find_queue(&mut self, name: &str) -> Result<Queue> {
        self.tx
            .find_queue(name)
            .await?
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    pub async fn count(&mut self, queue: &Queue) -> Result<MessageCounts> {
        Ok(self.tx.count_messages(&queue.name, self.now).await?)
    }

    fn retention_deadline(&self, queue: &Queue) -> Option<DateTime<Utc>> {
        queue
            .config
            .message_retention_period_ms
            .map(|ms| deadline_after(self.now, ms))
    }

    pub async fn send(
        &mut self,
        queue: &Queue,
        body: Vec<u8>,
        options: SendMessageOptions,
    ) -> Result<SendMessageResult> {
        queue.check_message_size(body.len())?;

        if options.deduplication_id.is_some() {
            // A retention-expired message must not keep blocking its deduplication id.
            self.tx.delete_expired_messages(&queue.name, self.now).await?;
        }

        let delay_ms = queue.delay_ms(options.delay_ms);
        let message = StoredMessage {
            id: Uuid::now_v7().to_string(),
            queue_name: queue.name.clone(),
            sequence: 0,
            body,
            attributes: options.attributes,
            priority: options.priority,
            sent_at: self.now,
            order_by: self.now,
            delay_until: (delay_ms > 0).then(|| deadline_after(self.now, delay_ms)),
            expires_at: self.retention_deadline(queue),
            not_visible_until: None,
            receipt_handle: None,
            receive_count: 0,
            first_received_at: None,
            last_nak_reason: None,
            deduplication_id: options.deduplication_id,
        };
        let id = self.insert(queue, message).await?;
        Ok(SendMessageResult { id })
    }

    /// Insert a prepared record and announce it to waiters.
    async fn insert(&mut self, queue: &Queue, message: StoredMessage) -> Result<String> {
        if let Err(e) = self.tx.insert_message(&message).await {
            return Err(duplicate_or_storage(queue, &message, e));
        }

        match message.delay_until {
            Some(at) if at > self.now => self.schedule(&queue.name, at),
            _ => self
                .tx
                .notify(ChangeNotification::new_message(queue.name.clone())),
        }

        tracing::debug!(
            queue_name = %queue.name,
            message_id = %message.id,
            priority = message.priority,
            "Message stored"
        );
        Ok(message.id)
    }

    /// Copy of `source` for a dead-letter destination: fresh id and receive
    /// count, ordered after existing messages of equal priority.
    pub(crate) async fn insert_copy(&mut self, target: &Queue, source: &StoredMessage) -> Result<String> {
        let copy = StoredMessage {
            id: Uuid::now_v7().to_string(),
            queue_name: target.name.clone(),
            sequence: 0,
            body: source.body.clone(),
            attributes: source.attributes.clone(),
            priority: source.priority,
            sent_at: self.now,
            order_by: self.now,
            delay_until: None,
            expires_at: self.retention_deadline(target),
            not_visible_until: None,
            receipt_handle: None,
            receive_count: 0,
            first_received_at: None,
            last_nak_reason: source.last_nak_reason.clone(),
            deduplication_id: None,
        };
        self.insert(target, copy).await
    }

    /// Hand out up to `max` available messages, each under a new receipt handle.
    pub async fn receive(
        &mut self,
        queue: &Queue,
        max: usize,
        visibility_timeout_ms: u64,
    ) -> Result<Vec<Message>> {
        let candidates = self
            .tx
            .query_messages(&queue.name, &MessageQuery::available(self.now, max))
            .await?;
        let not_visible_until = deadline_after(self.now, visibility_timeout_ms);

        let mut received = Vec::with_capacity(candidates.len());
        for mut message in candidates {
            message.receipt_handle = Some(Uuid::new_v4().to_string());
            message.not_visible_until = Some(not_visible_until);
            message.receive_count = message.receive_count.saturating_add(1);
            message.first_received_at.get_or_insert(self.now);
            if !self.tx.update_message(&message).await? {
                continue;
            }
            tracing::debug!(
                queue_name = %queue.name,
                message_id = %message.id,
                receive_count = message.receive_count,
                "Message received"
            );
            received.push(message.to_message(self.now));
        }

        if !received.is_empty() {
            self.schedule(&queue.name, not_visible_until);
        }
        Ok(received)
    }

    pub async fn peek(&mut self, queue: &Queue, options: PeekMessagesOptions) -> Result<Vec<Message>> {
        let query = MessageQuery {
            now: self.now,
            include_delayed: options.include_delayed,
            include_not_visible: options.include_not_visible,
            limit: Some(
                options
                    .max_number_of_messages
                    .unwrap_or(DEFAULT_MAX_NUMBER_OF_MESSAGES),
            ),
        };
        let messages = self.tx.query_messages(&queue.name, &query).await?;
        Ok(messages.iter().map(|m| m.to_message(self.now)).collect())
    }

    async fn find_message(&mut self, queue: &Queue, id: &str) -> Result<StoredMessage> {
        self.tx
            .find_message(&queue.name, id)
            .await?
            .filter(|m| m.expires_at.is_none_or(|at| at >= self.now))
            .ok_or_else(|| BrokerError::MessageNotFound {
                queue_name: queue.name.clone(),
                message_id: id.to_string(),
            })
    }

    /// The message currently delivered under `receipt_handle`.
    async fn find_delivery(&mut self, queue: &Queue, receipt_handle: &str) -> Result<StoredMessage> {
        let now = self.now;
        self.tx
            .find_message_by_receipt_handle(&queue.name, receipt_handle)
            .await?
            .filter(|m| m.active_receipt_handle(now) == Some(receipt_handle))
            .ok_or_else(|| invalid_receipt_handle(queue, receipt_handle))
    }

    fn check_receipt_handle(&self, queue: &Queue, message: &StoredMessage, receipt_handle: &str) -> Result<()> {
        if message.active_receipt_handle(self.now) == Some(receipt_handle) {
            Ok(())
        } else {
            Err(invalid_receipt_handle(queue, receipt_handle))
        }
    }

    /// Delete by id. With a receipt handle, it must be the message's current one;
    /// without, the delete is administrative.
    pub async fn delete(&mut self, queue: &Queue, id: &str, receipt_handle: Option<&str>) -> Result<()> {
        let message = self.find_message(queue, id).await?;
        if let Some(handle) = receipt_handle {
            self.check_receipt_handle(queue, &message, handle)?;
        }
        self.remove(queue, &message).await
    }

    pub async fn delete_by_receipt_handle(&mut self, queue: &Queue, receipt_handle: &str) -> Result<()> {
        let message = self.find_delivery(queue, receipt_handle).await?;
        self.remove(queue, &message).await
    }

    async fn remove(&mut self, queue: &Queue, message: &StoredMessage) -> Result<()> {
        if !self.tx.delete_message(&queue.name, &message.id).await? {
            return Err(BrokerError::MessageNotFound {
                queue_name: queue.name.clone(),
                message_id: message.id.clone(),
            });
        }
        tracing::debug!(queue_name = %queue.name, message_id = %message.id, "Message deleted");
        Ok(())
    }

    pub async fn update(
        &mut self,
        queue: &Queue,
        id: &str,
        receipt_handle: Option<&str>,
        options: UpdateMessageOptions,
    ) -> Result<()> {
        let mut message = self.find_message(queue, id).await?;
        if receipt_handle.is_none() && options.visibility_timeout_ms.is_some() {
            return Err(BrokerError::InvalidUpdate(
                "cannot update message visibility timeout without providing a receipt handle"
                    .to_string(),
            ));
        }
        if let Some(handle) = receipt_handle {
            self.check_receipt_handle(queue, &message, handle)?;
        }

        if let Some(priority) = options.priority {
            message.priority = priority;
        }
        if let Some(attributes) = options.attributes {
            message.attributes = attributes;
        }

        match options.visibility_timeout_ms {
            Some(0) => {
                self.release(queue, message).await?;
            }
            Some(ms) => {
                let at = deadline_after(self.now, ms);
                message.not_visible_until = Some(at);
                self.tx.update_message(&message).await?;
                self.schedule(&queue.name, at);
            }
            None => {
                self.tx.update_message(&message).await?;
            }
        }
        Ok(())
    }

    /// Extend or shorten the current delivery. Zero returns the message immediately.
    pub async fn change_visibility(
        &mut self,
        queue: &Queue,
        receipt_handle: &str,
        visibility_timeout_ms: u64,
    ) -> Result<()> {
        let message = self.find_delivery(queue, receipt_handle).await?;
        let options = UpdateMessageOptions {
            visibility_timeout_ms: Some(visibility_timeout_ms),
            ..Default::default()
        };
        self.update(queue, &message.id, Some(receipt_handle), options)
            .await
    }

    /// Give a delivery back before its visibility timeout.
    pub async fn nak(&mut self, queue: &Queue, receipt_handle: &str, reason: Option<String>) -> Result<Release> {
        let mut message = self.find_delivery(queue, receipt_handle).await?;
        message.last_nak_reason = reason;
        tracing::debug!(queue_name = %queue.name, message_id = %message.id, "Message nak'd");
        self.release(queue, message).await
    }

    /// End a delivery: dead-letter the message once it has been received more
    /// often than allowed, otherwise make it available again.
    pub(crate) async fn release(&mut self, queue: &Queue, mut message: StoredMessage) -> Result<Release> {
        message.clear_delivery();
        if let Some(target) = queue.dead_letter_for(message.receive_count) {
            if self.dead_letter(queue, &message, target).await? {
                return Ok(Release::DeadLettered);
            }
        }
        match queue.config.nak_expire_behavior {
            NakExpireBehavior::Retry => {}
            NakExpireBehavior::MoveToEnd => message.order_by = self.now,
            NakExpireBehavior::DecreasePriorityBy(amount) => {
                message.priority = message.priority.saturating_sub(i64::from(amount));
            }
        }
        self.tx.update_message(&message).await?;
        self.tx
            .notify(ChangeNotification::new_message(queue.name.clone()));
        Ok(Release::Available)
    }

    async fn dead_letter(
        &mut self,
        queue: &Queue,
        message: &StoredMessage,
        target: &DeadLetterTarget,
    ) -> Result<bool> {
        let routed = match target {
            DeadLetterTarget::Queue(name) => match self.tx.find_queue(name).await? {
                Some(dead_letter_queue) => {
                    self.insert_copy(&dead_letter_queue, message).await?;
                    true
                }
                None => false,
            },
            DeadLetterTarget::Topic(name) => TopicEngine::new(self)
                .publish_copy(name, message)
                .await?
                .is_some(),
        };
        if !routed {
            tracing::warn!(
                queue_name = %queue.name,
                target = ?target,
                "Dead letter target does not exist, returning message to its queue"
            );
            return Ok(false);
        }

        self.tx.delete_message(&queue.name, &message.id).await?;
        tracing::debug!(
            queue_name = %queue.name,
            message_id = %message.id,
            receive_count = message.receive_count,
            target = ?target,
            "Message dead-lettered"
        );
        Ok(true)
    }

    /// Resolve deliveries whose visibility deadline has passed.
    pub async fn expire_deliveries(&mut self, queue: &Queue) -> Result<(usize, usize)> {
        let expired = self
            .tx
            .find_expired_deliveries(&queue.name, self.now)
            .await?;
        let mut returned = 0;
        let mut dead_lettered = 0;
        for message in expired {
            match self.release(queue, message).await? {
                Release::Available => returned += 1,
                Release::DeadLettered => dead_lettered += 1,
            }
        }
        Ok((returned, dead_lettered))
    }

    /// Purge retention-expired messages and resolve expired deliveries.
    pub async fn sweep(&mut self, queue: &Queue) -> Result<SweepResult> {
        let purged = self
            .tx
            .delete_expired_messages(&queue.name, self.now)
            .await?;
        let (returned, dead_lettered) = self.expire_deliveries(queue).await?;
        let result = SweepResult {
            purged,
            returned,
            dead_lettered,
        };
        if !result.is_empty() {
            tracing::debug!(
                queue_name = %queue.name,
                purged,
                returned,
                dead_lettered,
                "Queue swept"
            );
        }
        Ok(result)
    }

    /// Move every available message of `source` into `target`, keeping ids
    /// and order. Retention restarts under the target's policy.
    ///
    /// A message whose id or deduplication id is already taken in `target`
    /// stays in `source`.
    pub async fn move_messages(&mut self, source: &Queue, target: &Queue) -> Result<u64> {
        let query = MessageQuery {
            now: self.now,
            include_delayed: false,
            include_not_visible: false,
            limit: None,
        };
        let messages = self.tx.query_messages(&source.name, &query).await?;
        self.tx.delete_expired_messages(&target.name, self.now).await?;
        let mut moved = 0;
        let mut skipped = 0;
        for mut message in messages {
            if self.conflicts_in(target, &message).await? {
                skipped += 1;
                continue;
            }
            self.tx.delete_message(&source.name, &message.id).await?;
            message.queue_name = target.name.clone();
            message.expires_at = self.retention_deadline(target);
            message.clear_delivery();
            self.insert(target, message).await?;
            moved += 1;
        }
        if moved > 0 || skipped > 0 {
            tracing::debug!(
                source = %source.name,
                target = %target.name,
                moved,
                skipped,
                "Messages moved"
            );
        }
        Ok(moved)
    }

    async fn conflicts_in(&mut self, target: &Queue, message: &StoredMessage) -> Result<bool> {
        if self.tx.find_message(&target.name, &message.id).await?.is_some() {
            return Ok(true);
        }
        match &message.deduplication_id {
            Some(deduplication_id) => Ok(self
                .tx
                .find_message_by_deduplication_id(&target.name, deduplication_id)
                .await?
                .is_some()),
            None => Ok(false),
        }
    }

    pub async fn purge(&mut self, queue: &Queue) -> Result<u64> {
        let purged = self.tx.purge_messages(&queue.name).await?;
        tracing::debug!(queue_name = %queue.name, purged, "Queue purged");
        Ok(purged)
    }
}

fn invalid_receipt_handle(queue: &Queue, receipt_handle: &str) -> BrokerError {
    BrokerError::ReceiptHandleIsInvalid {
        queue_name: queue.name.clone(),
        receipt_handle: receipt_handle.to_string(),
    }
}

fn duplicate_or_storage(queue: &Queue, message: &StoredMessage, err: StorageError) -> BrokerError {
    match (&message.deduplication_id, err.is_conflict()) {
        (Some(deduplication_id), true) => BrokerError::DuplicateMessage {
            queue_name: queue.name.clone(),
            deduplication_id: deduplication_id.clone(),
        },
        _ => BrokerError::Storage(err),
    }
}
