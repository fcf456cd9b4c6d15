use crate::error::{BrokerError, Result};
use crate::queue::{
    validate_queue_name, DeadLetterTarget, MoveMessagesResult, Queue, QueueConfig, QueueEngine,
    QueueInfo,
};
use crate::storage::ChangeNotification;

use super::{lookup_name, topic_lock_key, Store};

/// Check that the dead-letter target named by `config` exists and normalize its name.
async fn resolve_dead_letter(engine: &mut QueueEngine<'_>, config: &mut QueueConfig) -> Result<()> {
    let Some(target) = config.dead_letter.take() else {
        return Ok(());
    };
    let resolved = match target {
        DeadLetterTarget::Queue(name) => {
            let name = lookup_name(&name);
            engine.find_queue(&name).await?;
            DeadLetterTarget::Queue(name)
        }
        DeadLetterTarget::Topic(name) => {
            let name = lookup_name(&name);
            if engine.transaction().find_topic(&name).await?.is_none() {
                return Err(BrokerError::TopicNotFound(name));
            }
            DeadLetterTarget::Topic(name)
        }
    };
    config.dead_letter = Some(resolved);
    Ok(())
}

/// Lock key of the dead-letter target named by `config`, if any.
fn dead_letter_lock_key(config: &QueueConfig) -> Option<String> {
    config.dead_letter.as_ref().map(|target| match target {
        DeadLetterTarget::Queue(name) => lookup_name(name),
        DeadLetterTarget::Topic(name) => topic_lock_key(&lookup_name(name)),
    })
}

/// First queue, other than `except`, that dead-letters into `target`.
pub(super) async fn dead_letter_referrer(
    engine: &mut QueueEngine<'_>,
    target: &DeadLetterTarget,
    except: Option<&str>,
) -> Result<Option<String>> {
    let mut referrers = engine
        .transaction()
        .find_queues_by_dead_letter(target)
        .await?;
    referrers.retain(|name| Some(name.as_str()) != except);
    referrers.sort();
    Ok(referrers.into_iter().next())
}

async fn queue_info(engine: &mut QueueEngine<'_>, queue: Queue) -> Result<QueueInfo> {
    let counts = engine.count(&queue).await?;
    Ok(QueueInfo::new(queue, counts))
}

impl Store {
    /// Create a queue. Repeating the call with an identical configuration
    /// succeeds without changes.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn create_queue(&self, queue_name: &str, config: QueueConfig) -> Result<QueueInfo> {
        let name = validate_queue_name(queue_name)?;
        config.validate(&name)?;

        // The target is locked too so it cannot be deleted before this commits.
        let lock_names = [Some(name.clone()), dead_letter_lock_key(&config)];
        let keys: Vec<&str> = lock_names.iter().flatten().map(String::as_str).collect();
        let info = self
            .transact(&keys, move |engine| {
                Box::pin(async move {
                    let mut config = config;
                    resolve_dead_letter(engine, &mut config).await?;

                    if let Some(existing) = engine.transaction().find_queue(&name).await? {
                        if existing.config != config {
                            return Err(BrokerError::QueueAlreadyExists {
                                queue_name: name,
                                reason: "a queue with a different configuration exists"
                                    .to_string(),
                            });
                        }
                        return queue_info(engine, existing).await;
                    }

                    let queue = Queue::new(name, config, engine.now());
                    if let Err(e) = engine.transaction().insert_queue(&queue).await {
                        return Err(if e.is_conflict() {
                            BrokerError::QueueAlreadyExists {
                                queue_name: queue.name,
                                reason: "created concurrently".to_string(),
                            }
                        } else {
                            e.into()
                        });
                    }
                    tracing::info!(queue_name = %queue.name, "Queue created");
                    queue_info(engine, queue).await
                })
            })
            .await?;
        Ok(info)
    }

    /// Replace a queue's configuration.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn update_queue(&self, queue_name: &str, config: QueueConfig) -> Result<QueueInfo> {
        let name = lookup_name(queue_name);
        config.validate(&name)?;

        let lock_names = [Some(name.clone()), dead_letter_lock_key(&config)];
        let keys: Vec<&str> = lock_names.iter().flatten().map(String::as_str).collect();
        self.transact(&keys, move |engine| {
            Box::pin(async move {
                let mut config = config;
                let mut queue = engine.find_queue(&name).await?;
                resolve_dead_letter(engine, &mut config).await?;

                let now = engine.now();
                queue.config = config;
                if !queue.touch(now) {
                    queue.expires_at = None;
                }
                queue.last_modified_at = now;
                if !engine.transaction().update_queue(&queue).await? {
                    return Err(BrokerError::QueueNotFound(name));
                }
                tracing::info!(queue_name = %queue.name, "Queue updated");
                queue_info(engine, queue).await
            })
        })
        .await
    }

    /// Delete a queue with its messages and subscriptions.
    ///
    /// # Errors
    ///
    /// `DeleteDeadLetterQueue` while another queue dead-letters into it.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn delete_queue(&self, queue_name: &str) -> Result<()> {
        let name = lookup_name(queue_name);
        let target = name.clone();
        self.transact(&[name.as_str()], move |engine| {
            Box::pin(async move {
                engine.find_queue(&target).await?;
                let reference = DeadLetterTarget::Queue(target.clone());
                if let Some(referenced_by) =
                    dead_letter_referrer(engine, &reference, Some(target.as_str())).await?
                {
                    return Err(BrokerError::DeleteDeadLetterQueue {
                        queue_name: target,
                        referenced_by,
                    });
                }
                engine.transaction().delete_queue(&target).await?;
                Ok(())
            })
        })
        .await?;

        self.forget_queue(&name);
        tracing::info!(queue_name = %name, "Queue deleted");
        Ok(())
    }

    /// Drop the wait signal of a deleted queue. Parked receivers wake up and
    /// observe `QueueNotFound`.
    pub(super) fn forget_queue(&self, name: &str) {
        self.inner.signals.notify(name);
        self.inner.signals.remove(name);
    }

    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn get_queue_info(&self, queue_name: &str) -> Result<QueueInfo> {
        let name = lookup_name(queue_name);
        self.transact(&[], move |engine| {
            Box::pin(async move {
                let queue = engine.find_queue(&name).await?;
                queue_info(engine, queue).await
            })
        })
        .await
    }

    /// Every queue with its message counts, sorted case-insensitively by name.
    #[tracing::instrument(skip_all)]
    pub async fn get_queue_infos(&self) -> Result<Vec<QueueInfo>> {
        let mut infos = self
            .transact(&[], |engine| {
                Box::pin(async move {
                    let queues = engine.transaction().list_queues().await?;
                    let mut infos = Vec::with_capacity(queues.len());
                    for queue in queues {
                        infos.push(queue_info(engine, queue).await?);
                    }
                    Ok(infos)
                })
            })
            .await?;
        infos.sort_by_cached_key(|info| info.name.to_lowercase());
        Ok(infos)
    }

    /// Stop deliveries. Sends are still accepted.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn pause_queue(&self, queue_name: &str) -> Result<()> {
        self.set_paused(queue_name, true).await
    }

    /// Resume deliveries and wake receivers parked on the queue.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn resume_queue(&self, queue_name: &str) -> Result<()> {
        self.set_paused(queue_name, false).await
    }

    async fn set_paused(&self, queue_name: &str, paused: bool) -> Result<()> {
        let name = lookup_name(queue_name);
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let mut queue = engine.find_queue(&name).await?;
                if queue.paused == paused {
                    return Ok(());
                }
                queue.paused = paused;
                queue.last_modified_at = engine.now();
                engine.transaction().update_queue(&queue).await?;
                if !paused {
                    engine
                        .transaction()
                        .notify(ChangeNotification::resume(name.clone()));
                }
                tracing::info!(queue_name = %name, paused, "Queue pause state changed");
                Ok(())
            })
        })
        .await
    }

    /// Remove every message of a queue. Returns the number removed.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name))]
    pub async fn purge_queue(&self, queue_name: &str) -> Result<u64> {
        let name = lookup_name(queue_name);
        let key = name.clone();
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                let queue = engine.find_queue(&name).await?;
                engine.purge(&queue).await
            })
        })
        .await
    }

    /// Move every available message from `source` to `target`.
    #[tracing::instrument(skip_all, fields(source = %source, target = %target))]
    pub async fn move_messages(&self, source: &str, target: &str) -> Result<MoveMessagesResult> {
        let source = lookup_name(source);
        let target = lookup_name(target);
        if source == target {
            return Err(BrokerError::InvalidUpdate(
                "source and target queue must differ".to_string(),
            ));
        }

        let (source_key, target_key) = (source.clone(), target.clone());
        let moved_message_count = self
            .transact(&[source_key.as_str(), target_key.as_str()], move |engine| {
                Box::pin(async move {
                    let source = engine.find_queue(&source).await?;
                    let target = engine.find_queue(&target).await?;
                    engine.move_messages(&source, &target).await
                })
            })
            .await?;
        Ok(MoveMessagesResult {
            moved_message_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::queue::SendMessageOptions;
    use crate::store::tests::memory_store;

    #[tokio::test]
    async fn test_create_is_idempotent_for_same_config() {
        let (store, _clock) = memory_store().await;
        let config = QueueConfig {
            visibility_timeout_ms: Some(5_000),
            ..Default::default()
        };
        store.create_queue(" orders ", config.clone()).await.unwrap();
        let info = store.create_queue("orders", config).await.unwrap();
        assert_eq!(info.name, "orders");

        let err = store
            .create_queue("orders", QueueConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QueueAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (store, _clock) = memory_store().await;
        for name in ["", "   ", "has space", "semi;colon"] {
            assert!(matches!(
                store.create_queue(name, QueueConfig::default()).await,
                Err(BrokerError::InvalidQueueName(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_dead_letter_target_must_exist() {
        let (store, _clock) = memory_store().await;
        let config = QueueConfig::default().with_dead_letter_queue("dlq", 2);
        assert!(matches!(
            store.create_queue("orders", config.clone()).await,
            Err(BrokerError::QueueNotFound(name)) if name == "dlq"
        ));

        let topic_config = QueueConfig::default().with_dead_letter_topic("dead", 2);
        assert!(matches!(
            store.create_queue("orders", topic_config).await,
            Err(BrokerError::TopicNotFound(_))
        ));

        store.create_queue("dlq", QueueConfig::default()).await.unwrap();
        store.create_queue("orders", config).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter_queue_cannot_be_deleted_while_referenced() {
        let (store, _clock) = memory_store().await;
        store.create_queue("dlq", QueueConfig::default()).await.unwrap();
        store
            .create_queue("orders", QueueConfig::default().with_dead_letter_queue("dlq", 1))
            .await
            .unwrap();

        let err = store.delete_queue("dlq").await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::DeleteDeadLetterQueue { ref referenced_by, .. } if referenced_by == "orders"
        ));

        store.delete_queue("orders").await.unwrap();
        store.delete_queue("dlq").await.unwrap();
        assert!(matches!(
            store.get_queue_info("dlq").await,
            Err(BrokerError::QueueNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dead_letter_reference_and_delete_do_not_interleave() {
        let (store, _clock) = memory_store().await;
        for round in 0..50 {
            let dlq = format!("dlq-{round}");
            let source = format!("source-{round}");
            store.create_queue(&dlq, QueueConfig::default()).await.unwrap();

            let create = {
                let store = store.clone();
                let config = QueueConfig::default().with_dead_letter_queue(&dlq, 1);
                let source = source.clone();
                tokio::spawn(async move { store.create_queue(&source, config).await })
            };
            let delete = {
                let store = store.clone();
                let dlq = dlq.clone();
                tokio::spawn(async move { store.delete_queue(&dlq).await })
            };
            let created = create.await.unwrap();
            let deleted = delete.await.unwrap();

            match (created, deleted) {
                (Ok(_), Err(BrokerError::DeleteDeadLetterQueue { .. })) => {
                    store.get_queue_info(&dlq).await.unwrap();
                }
                (Err(BrokerError::QueueNotFound(name)), Ok(())) => assert_eq!(name, dlq),
                other => panic!("dead letter reference raced with delete: {other:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_and_delete_do_not_interleave() {
        let (store, _clock) = memory_store().await;
        store.create_topic("events", HashMap::new()).await.unwrap();
        for round in 0..50 {
            let queue = format!("sub-{round}");
            store.create_queue(&queue, QueueConfig::default()).await.unwrap();

            let subscribe = {
                let store = store.clone();
                let queue = queue.clone();
                tokio::spawn(async move { store.subscribe_queue("events", &queue).await })
            };
            let delete = {
                let store = store.clone();
                let queue = queue.clone();
                tokio::spawn(async move { store.delete_queue(&queue).await })
            };
            let _ = subscribe.await.unwrap();
            delete.await.unwrap().unwrap();
        }
        let info = store.get_topic_info("events").await.unwrap();
        assert!(info.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_infos_sorted_case_insensitively() {
        let (store, _clock) = memory_store().await;
        for name in ["beta", "Alpha", "gamma"] {
            store.create_queue(name, QueueConfig::default()).await.unwrap();
        }
        let names: Vec<_> = store
            .get_queue_infos()
            .await
            .unwrap()
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn test_update_replaces_config() {
        let (store, _clock) = memory_store().await;
        store.create_queue("orders", QueueConfig::default()).await.unwrap();
        let tags = HashMap::from([("team".to_string(), "billing".to_string())]);
        let info = store
            .update_queue(
                "orders",
                QueueConfig {
                    max_message_size: Some(4),
                    tags: tags.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(info.config.tags, tags);

        let err = store
            .send_message("orders", "too long", SendMessageOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::MessageExceededMaxMessageSize { size: 8, max: 4 }));
    }

    #[tokio::test]
    async fn test_purge_and_move() {
        let (store, _clock) = memory_store().await;
        store.create_queue("a", QueueConfig::default()).await.unwrap();
        store.create_queue("b", QueueConfig::default()).await.unwrap();
        for body in ["1", "2", "3"] {
            store
                .send_message("a", body, SendMessageOptions::default())
                .await
                .unwrap();
        }

        let moved = store.move_messages("a", "b").await.unwrap();
        assert_eq!(moved.moved_message_count, 3);
        assert_eq!(store.get_queue_info("a").await.unwrap().number_of_messages, 0);
        assert_eq!(store.purge_queue("b").await.unwrap(), 3);
        assert!(matches!(
            store.move_messages("a", " a").await,
            Err(BrokerError::InvalidUpdate(_))
        ));
    }
}
