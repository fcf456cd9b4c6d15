use std::collections::HashMap;

use crate::clock::deadline_after;
use crate::error::{BrokerError, Result};
use crate::queue::{
    DeleteMessageEntry, DeleteMessageError, DeleteMessageOutcome, DeleteMessagesResult, Message,
    PeekMessagesOptions, ReceiveMessagesOptions, Release, SendMessageEntry, SendMessageOptions,
    SendMessageResult, UpdateMessageOptions, DEFAULT_MAX_NUMBER_OF_MESSAGES,
};
use crate::signal::WaitOutcome;

use super::{lookup_name, Store};

/// Outcome of one receive attempt.
struct Attempt {
    messages: Vec<Message>,
    /// Effective long-poll wait of the queue for this call
    wait_time_ms: u64,
}

impl Store {
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn send_message(
        &self,
        queue_name: &str,
        body: impl Into<Vec<u8>>,
        options: SendMessageOptions,
    ) -> Result<SendMessageResult> {
        let name = lookup_name(queue_name);
        let body = body.into();
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let queue = engine.find_queue(&name).await?;
                engine.send(&queue, body, options).await
            })
        })
        .await
    }

    /// Send a batch. Every entry is its own transaction, so one failure
    /// does not affect the others; results are in entry order.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name, count = entries.len()))]
    pub async fn send_messages(
        &self,
        queue_name: &str,
        entries: Vec<SendMessageEntry>,
    ) -> Vec<Result<SendMessageResult>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(self.send_message(queue_name, entry.body, entry.options).await);
        }
        results
    }

    pub async fn receive_message(
        &self,
        queue_name: &str,
        options: ReceiveMessagesOptions,
    ) -> Result<Option<Message>> {
        let options = ReceiveMessagesOptions {
            max_number_of_messages: Some(1),
            ..options
        };
        let mut messages = self.receive_messages(queue_name, options).await?;
        Ok(messages.pop())
    }

    /// Receive up to `max_number_of_messages` messages.
    ///
    /// When nothing is available the call parks on the queue's wait signal
    /// until a message arrives or the wait time elapses; the latter returns an
    /// empty batch. An abort signal ends the wait with `Aborted`.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn receive_messages(
        &self,
        queue_name: &str,
        options: ReceiveMessagesOptions,
    ) -> Result<Vec<Message>> {
        let name = lookup_name(queue_name);
        let max = options
            .max_number_of_messages
            .unwrap_or(DEFAULT_MAX_NUMBER_OF_MESSAGES)
            .max(1);
        let mut abort = options.abort;
        let started = self.inner.clock.now();
        let mut deadline = None;

        loop {
            if abort.as_ref().is_some_and(|signal| signal.is_aborted()) {
                return Err(BrokerError::Aborted(format!(
                    "receive on queue \"{name}\" was cancelled"
                )));
            }

            // Listen before looking so a send committed in between still wakes us.
            let mut listener = self.inner.signals.listen(&name);
            let attempt = self
                .try_receive(&name, max, options.visibility_timeout_ms, options.wait_time_ms)
                .await?;
            if !attempt.messages.is_empty() {
                return Ok(attempt.messages);
            }

            let deadline = *deadline.get_or_insert_with(|| deadline_after(started, attempt.wait_time_ms));
            if self.inner.clock.now() >= deadline {
                return Ok(Vec::new());
            }

            match listener
                .wait_until(self.inner.clock.as_ref(), deadline, abort.as_mut())
                .await
            {
                WaitOutcome::Signaled => continue,
                WaitOutcome::TimedOut => return Ok(Vec::new()),
                WaitOutcome::Cancelled => {
                    return Err(BrokerError::Aborted(format!(
                        "receive on queue \"{name}\" was cancelled"
                    )))
                }
            }
        }
    }

    async fn try_receive(
        &self,
        name: &str,
        max: usize,
        visibility_timeout_ms: Option<u64>,
        wait_time_ms: Option<u64>,
    ) -> Result<Attempt> {
        let name = name.to_string();
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let mut queue = engine.find_queue(&name).await?;
                let wait_time_ms = queue.wait_time_ms(wait_time_ms);
                if queue.touch(engine.now()) {
                    engine.transaction().update_queue(&queue).await?;
                }
                if queue.paused {
                    return Ok(Attempt {
                        messages: Vec::new(),
                        wait_time_ms,
                    });
                }

                // Deliveries past their deadline must be dead-lettered, not re-delivered.
                engine.expire_deliveries(&queue).await?;
                let visibility_timeout_ms = queue.visibility_timeout_ms(visibility_timeout_ms);
                let messages = engine.receive(&queue, max, visibility_timeout_ms).await?;
                Ok(Attempt {
                    messages,
                    wait_time_ms,
                })
            })
        })
        .await
    }

    /// Read messages without changing their state.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn peek_messages(
        &self,
        queue_name: &str,
        options: PeekMessagesOptions,
    ) -> Result<Vec<Message>> {
        let name = lookup_name(queue_name);
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let mut queue = engine.find_queue(&name).await?;
                if queue.touch(engine.now()) {
                    engine.transaction().update_queue(&queue).await?;
                }
                engine.peek(&queue, options).await
            })
        })
        .await
    }

    /// Delete a message by id. A receipt handle, when given, must be the
    /// message's current one.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name, message_id = %id))]
    pub async fn delete_message(
        &self,
        queue_name: &str,
        id: &str,
        receipt_handle: Option<&str>,
    ) -> Result<()> {
        let name = lookup_name(queue_name);
        let id = id.to_string();
        let receipt_handle = receipt_handle.map(str::to_string);
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let queue = engine.find_queue(&name).await?;
                engine.delete(&queue, &id, receipt_handle.as_deref()).await
            })
        })
        .await
    }

    /// Delete a batch, reporting an outcome per message id.
    ///
    /// # Errors
    ///
    /// Only failures that are not about an individual message (missing queue,
    /// storage errors) fail the whole call.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name, count = entries.len()))]
    pub async fn delete_messages(
        &self,
        queue_name: &str,
        entries: Vec<DeleteMessageEntry>,
    ) -> Result<DeleteMessagesResult> {
        let mut messages = HashMap::with_capacity(entries.len());
        for entry in entries {
            let outcome = match self
                .delete_message(queue_name, &entry.id, entry.receipt_handle.as_deref())
                .await
            {
                Ok(()) => DeleteMessageOutcome {
                    deleted: true,
                    error: None,
                    error_message: None,
                },
                Err(e @ BrokerError::MessageNotFound { .. }) => DeleteMessageOutcome {
                    deleted: false,
                    error: Some(DeleteMessageError::MessageNotFound),
                    error_message: Some(e.to_string()),
                },
                Err(e @ BrokerError::ReceiptHandleIsInvalid { .. }) => DeleteMessageOutcome {
                    deleted: false,
                    error: Some(DeleteMessageError::ReceiptHandleIsInvalid),
                    error_message: Some(e.to_string()),
                },
                Err(e) => return Err(e),
            };
            messages.insert(entry.id, outcome);
        }
        Ok(DeleteMessagesResult { messages })
    }

    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn delete_message_by_receipt_handle(
        &self,
        queue_name: &str,
        receipt_handle: &str,
    ) -> Result<()> {
        let name = lookup_name(queue_name);
        let receipt_handle = receipt_handle.to_string();
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let queue = engine.find_queue(&name).await?;
                engine.delete_by_receipt_handle(&queue, &receipt_handle).await
            })
        })
        .await
    }

    /// Change priority or attributes, or the visibility timeout of the
    /// current delivery (which needs its receipt handle).
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name, message_id = %id))]
    pub async fn update_message(
        &self,
        queue_name: &str,
        id: &str,
        receipt_handle: Option<&str>,
        options: UpdateMessageOptions,
    ) -> Result<()> {
        let name = lookup_name(queue_name);
        let id = id.to_string();
        let receipt_handle = receipt_handle.map(str::to_string);
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let queue = engine.find_queue(&name).await?;
                engine
                    .update(&queue, &id, receipt_handle.as_deref(), options)
                    .await
            })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn change_message_visibility(
        &self,
        queue_name: &str,
        receipt_handle: &str,
        visibility_timeout_ms: u64,
    ) -> Result<()> {
        let name = lookup_name(queue_name);
        let receipt_handle = receipt_handle.to_string();
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let queue = engine.find_queue(&name).await?;
                engine
                    .change_visibility(&queue, &receipt_handle, visibility_timeout_ms)
                    .await
            })
        })
        .await
    }

    /// Return a delivery immediately, recording `reason`. The message is
    /// dead-lettered instead when it has exceeded its max receive count.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn nak_message(
        &self,
        queue_name: &str,
        receipt_handle: &str,
        reason: Option<String>,
    ) -> Result<Release> {
        let name = lookup_name(queue_name);
        let receipt_handle = receipt_handle.to_string();
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let queue = engine.find_queue(&name).await?;
                engine.nak(&queue, &receipt_handle, reason).await
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::queue::{MessageState, QueueConfig};
    use crate::signal::AbortController;
    use crate::store::tests::memory_store;

    fn long_poll(wait_time_ms: u64) -> ReceiveMessagesOptions {
        ReceiveMessagesOptions {
            wait_time_ms: Some(wait_time_ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_priority_then_age() {
        let (store, _clock) = memory_store().await;
        store.create_queue("q1", QueueConfig::default()).await.unwrap();
        store
            .send_message("q1", "hello", SendMessageOptions::with_priority(1))
            .await
            .unwrap();
        store
            .send_message("q1", "world", SendMessageOptions::with_priority(5))
            .await
            .unwrap();

        let first = store
            .receive_message("q1", Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.body_text(), "world");
        store
            .delete_message("q1", &first.id, first.receipt_handle.as_deref())
            .await
            .unwrap();

        let second = store
            .receive_message("q1", Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.body_text(), "hello");
    }

    #[tokio::test]
    async fn test_batch_send_isolates_failures() {
        let (store, _clock) = memory_store().await;
        store
            .create_queue(
                "q",
                QueueConfig {
                    max_message_size: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let entries = ["ok", "too big", "ok2"]
            .into_iter()
            .map(|body| SendMessageEntry {
                body: body.as_bytes().to_vec(),
                options: SendMessageOptions::default(),
            })
            .collect();
        let results = store.send_messages("q", entries).await;
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(BrokerError::MessageExceededMaxMessageSize { .. })
        ));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_batch_delete_reports_per_id() {
        let (store, _clock) = memory_store().await;
        store.create_queue("q", QueueConfig::default()).await.unwrap();
        let sent = store
            .send_message("q", "a", SendMessageOptions::default())
            .await
            .unwrap();
        let received = store
            .receive_message("q", Default::default())
            .await
            .unwrap()
            .unwrap();

        let result = store
            .delete_messages(
                "q",
                vec![
                    DeleteMessageEntry {
                        id: sent.id.clone(),
                        receipt_handle: Some("stale".into()),
                    },
                    DeleteMessageEntry {
                        id: "missing".into(),
                        receipt_handle: None,
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            result.messages[&sent.id].error,
            Some(DeleteMessageError::ReceiptHandleIsInvalid)
        );
        assert_eq!(
            result.messages["missing"].error,
            Some(DeleteMessageError::MessageNotFound)
        );
        assert_eq!(result.deleted_count(), 0);

        let result = store
            .delete_messages(
                "q",
                vec![DeleteMessageEntry {
                    id: sent.id.clone(),
                    receipt_handle: received.receipt_handle,
                }],
            )
            .await
            .unwrap();
        assert_eq!(result.deleted_count(), 1);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_send() {
        let (store, _clock) = memory_store().await;
        store.create_queue("q", QueueConfig::default()).await.unwrap();

        let receiver = {
            let store = store.clone();
            tokio::spawn(async move { store.receive_message("q", long_poll(60_000)).await })
        };
        while store.inner.signals.waiter_count("q") == 0 {
            tokio::task::yield_now().await;
        }

        store
            .send_message("q", "late", SendMessageOptions::default())
            .await
            .unwrap();
        let message = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(message.body_text(), "late");
    }

    #[tokio::test]
    async fn test_long_poll_times_out_empty() {
        let (store, clock) = memory_store().await;
        store.create_queue("q", QueueConfig::default()).await.unwrap();

        let receiver = {
            let store = store.clone();
            tokio::spawn(async move { store.receive_messages("q", long_poll(1_000)).await })
        };
        clock.wait_for_sleepers(1).await;
        clock.advance(Duration::from_millis(1_000));

        assert!(receiver.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_is_distinct_from_timeout() {
        let (store, clock) = memory_store().await;
        store.create_queue("q", QueueConfig::default()).await.unwrap();
        let controller = AbortController::new();

        let receiver = {
            let store = store.clone();
            let options = ReceiveMessagesOptions {
                abort: Some(controller.signal()),
                ..long_poll(60_000)
            };
            tokio::spawn(async move { store.receive_messages("q", options).await })
        };
        clock.wait_for_sleepers(1).await;
        controller.abort();

        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::Aborted(_)));
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test]
    async fn test_paused_queue_holds_receivers_until_resume() {
        let (store, _clock) = memory_store().await;
        store.create_queue("q", QueueConfig::default()).await.unwrap();
        store.pause_queue("q").await.unwrap();
        store
            .send_message("q", "held", SendMessageOptions::default())
            .await
            .unwrap();
        assert!(store
            .receive_message("q", Default::default())
            .await
            .unwrap()
            .is_none());

        let receiver = {
            let store = store.clone();
            tokio::spawn(async move { store.receive_message("q", long_poll(60_000)).await })
        };
        while store.inner.signals.waiter_count("q") == 0 {
            tokio::task::yield_now().await;
        }
        store.resume_queue("q").await.unwrap();

        let message = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(message.body_text(), "held");
    }

    #[tokio::test]
    async fn test_visibility_deadline_is_exact() {
        let (store, clock) = memory_store().await;
        store
            .create_queue(
                "q",
                QueueConfig {
                    visibility_timeout_ms: Some(1_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .send_message("q", "m", SendMessageOptions::default())
            .await
            .unwrap();
        store
            .receive_message("q", Default::default())
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_millis(999));
        assert!(store
            .receive_message("q", Default::default())
            .await
            .unwrap()
            .is_none());

        clock.advance(Duration::from_millis(1));
        let again = store
            .receive_message("q", Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.receive_count, 2);
    }

    #[tokio::test]
    async fn test_scheduled_wake_releases_long_poll() {
        let (store, clock) = memory_store().await;
        store
            .create_queue(
                "q",
                QueueConfig {
                    visibility_timeout_ms: Some(1_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .send_message("q", "m", SendMessageOptions::default())
            .await
            .unwrap();
        store
            .receive_message("q", Default::default())
            .await
            .unwrap()
            .unwrap();

        let receiver = {
            let store = store.clone();
            tokio::spawn(async move { store.receive_message("q", long_poll(60_000)).await })
        };
        // The visibility wake and the long-poll deadline.
        clock.wait_for_sleepers(2).await;
        clock.advance(Duration::from_millis(1_000));

        let message = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(message.body_text(), "m");
        assert_eq!(message.receive_count, 2);
        assert_eq!(message.state, MessageState::NotVisible);
    }

    #[tokio::test]
    async fn test_update_and_change_visibility() {
        let (store, _clock) = memory_store().await;
        store.create_queue("q", QueueConfig::default()).await.unwrap();
        let sent = store
            .send_message("q", "m", SendMessageOptions::default())
            .await
            .unwrap();

        store
            .update_message(
                "q",
                &sent.id,
                None,
                UpdateMessageOptions {
                    priority: Some(7),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let received = store
            .receive_message("q", Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.priority, 7);
        let handle = received.receipt_handle.unwrap();

        store
            .change_message_visibility("q", &handle, 0)
            .await
            .unwrap();
        let again = store
            .receive_message("q", Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.receive_count, 2);
        assert!(matches!(
            store.delete_message_by_receipt_handle("q", &handle).await,
            Err(BrokerError::ReceiptHandleIsInvalid { .. })
        ));
        store
            .delete_message_by_receipt_handle("q", again.receipt_handle.as_deref().unwrap())
            .await
            .unwrap();
    }
}
