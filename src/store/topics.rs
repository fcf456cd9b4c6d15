use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::queue::{DeadLetterTarget, QueueEngine, SendMessageOptions};
use crate::topic::{
    validate_topic_name, PublishMessageResult, Subscription, SubscriptionProtocol, Topic,
    TopicEngine, TopicInfo,
};

use super::queues::dead_letter_referrer;
use super::{lookup_name, topic_lock_key, Store};

async fn topic_info(engine: &mut QueueEngine<'_>, topic: Topic) -> Result<TopicInfo> {
    let subscriptions = engine
        .transaction()
        .list_subscriptions(&topic.name)
        .await?;
    Ok(TopicInfo {
        name: topic.name,
        tags: topic.tags,
        created_at: topic.created_at,
        last_modified_at: topic.last_modified_at,
        subscriptions,
    })
}

impl Store {
    /// Create a topic. Repeating the call with identical tags succeeds.
    #[tracing::instrument(skip_all, fields(topic_name = %topic_name))]
    pub async fn create_topic(
        &self,
        topic_name: &str,
        tags: HashMap<String, String>,
    ) -> Result<TopicInfo> {
        let name = validate_topic_name(topic_name)?;
        self.transact(&[], move |engine| {
            Box::pin(async move {
                if let Some(existing) = engine.transaction().find_topic(&name).await? {
                    if existing.tags != tags {
                        return Err(BrokerError::TopicAlreadyExists {
                            topic_name: name,
                            reason: "a topic with different tags exists".to_string(),
                        });
                    }
                    return topic_info(engine, existing).await;
                }

                let now = engine.now();
                let topic = Topic {
                    name,
                    tags,
                    created_at: now,
                    last_modified_at: now,
                };
                if let Err(e) = engine.transaction().insert_topic(&topic).await {
                    return Err(if e.is_conflict() {
                        BrokerError::TopicAlreadyExists {
                            topic_name: topic.name,
                            reason: "created concurrently".to_string(),
                        }
                    } else {
                        e.into()
                    });
                }
                tracing::info!(topic_name = %topic.name, "Topic created");
                topic_info(engine, topic).await
            })
        })
        .await
    }

    /// Delete a topic and its subscriptions.
    ///
    /// # Errors
    ///
    /// `DeleteDeadLetterTopic` while a queue dead-letters into it.
    #[tracing::instrument(skip_all, fields(topic_name = %topic_name))]
    pub async fn delete_topic(&self, topic_name: &str) -> Result<()> {
        let name = lookup_name(topic_name);
        let key = topic_lock_key(&name);
        self.transact(&[key.as_str()], move |engine| {
            Box::pin(async move {
                TopicEngine::new(engine).find_topic(&name).await?;
                let reference = DeadLetterTarget::Topic(name.clone());
                if let Some(referenced_by) = dead_letter_referrer(engine, &reference, None).await? {
                    return Err(BrokerError::DeleteDeadLetterTopic {
                        topic_name: name,
                        referenced_by,
                    });
                }
                engine.transaction().delete_topic(&name).await?;
                tracing::info!(topic_name = %name, "Topic deleted");
                Ok(())
            })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(topic_name = %topic_name))]
    pub async fn get_topic_info(&self, topic_name: &str) -> Result<TopicInfo> {
        let name = lookup_name(topic_name);
        self.transact(&[], move |engine| {
            Box::pin(async move {
                let topic = TopicEngine::new(engine).find_topic(&name).await?;
                topic_info(engine, topic).await
            })
        })
        .await
    }

    /// Every topic with its subscriptions, sorted case-insensitively by name.
    #[tracing::instrument(skip_all)]
    pub async fn get_topic_infos(&self) -> Result<Vec<TopicInfo>> {
        let mut infos = self
            .transact(&[], |engine| {
                Box::pin(async move {
                    let topics = engine.transaction().list_topics().await?;
                    let mut infos = Vec::with_capacity(topics.len());
                    for topic in topics {
                        infos.push(topic_info(engine, topic).await?);
                    }
                    Ok(infos)
                })
            })
            .await?;
        infos.sort_by_cached_key(|info| info.name.to_lowercase());
        Ok(infos)
    }

    /// Subscribe a queue to a topic. Subscribing again returns the existing
    /// subscription.
    #[tracing::instrument(skip_all, fields(topic_name = %topic_name, queue_name = %queue_name))]
    pub async fn subscribe_queue(&self, topic_name: &str, queue_name: &str) -> Result<Subscription> {
        let topic_name = lookup_name(topic_name);
        let queue_name = lookup_name(queue_name);
        let lock_names = [queue_name.clone(), topic_lock_key(&topic_name)];
        let keys: Vec<&str> = lock_names.iter().map(String::as_str).collect();
        self.transact(&keys, move |engine| {
            Box::pin(async move {
                TopicEngine::new(engine).find_topic(&topic_name).await?;
                engine.find_queue(&queue_name).await?;

                let tx = engine.transaction();
                if let Some(existing) = tx.find_subscription(&topic_name, &queue_name).await? {
                    return Ok(existing);
                }
                let subscription = Subscription {
                    id: Uuid::new_v4().to_string(),
                    topic_name,
                    protocol: SubscriptionProtocol::Queue,
                    queue_name,
                };
                if !tx.insert_subscription(&subscription).await? {
                    return tx
                        .find_subscription(&subscription.topic_name, &subscription.queue_name)
                        .await?
                        .ok_or_else(|| BrokerError::SubscriptionNotFound(subscription.id));
                }
                tracing::info!(
                    topic_name = %subscription.topic_name,
                    queue_name = %subscription.queue_name,
                    subscription_id = %subscription.id,
                    "Queue subscribed"
                );
                Ok(subscription)
            })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(subscription_id = %subscription_id))]
    pub async fn delete_subscription(&self, subscription_id: &str) -> Result<()> {
        let id = subscription_id.to_string();
        self.transact(&[], move |engine| {
            Box::pin(async move {
                if !engine.transaction().delete_subscription(&id).await? {
                    return Err(BrokerError::SubscriptionNotFound(id));
                }
                Ok(())
            })
        })
        .await
    }

    /// Send one replica to every subscribed queue, all in one transaction.
    #[tracing::instrument(skip_all, fields(topic_name = %topic_name))]
    pub async fn publish_message(
        &self,
        topic_name: &str,
        body: impl Into<Vec<u8>>,
        options: SendMessageOptions,
    ) -> Result<PublishMessageResult> {
        let name = lookup_name(topic_name);
        let body = body.into();

        let subscribers = self.subscribed_queue_names(&name).await?;
        let locks: Vec<&str> = subscribers.iter().map(String::as_str).collect();
        self.transact(&locks, move |engine| {
            Box::pin(async move { TopicEngine::new(engine).publish(&name, body, options).await })
        })
        .await
    }

    async fn subscribed_queue_names(&self, topic_name: &str) -> Result<Vec<String>> {
        let name = topic_name.to_string();
        self.transact(&[], move |engine| {
            Box::pin(async move {
                let subscriptions = engine.transaction().list_subscriptions(&name).await?;
                Ok(subscriptions.into_iter().map(|s| s.queue_name).collect())
            })
        })
        .await
    }
}
