use crate::error::{BrokerError, Result};
use crate::queue::{Queue, QueueEngine, SendMessageOptions};
use crate::storage::StoredMessage;

use super::models::{PublishMessageResult, Topic, TopicDelivery};

/// Topic fan-out, running inside the transaction of a [`QueueEngine`].
///
/// Every replica is an ordinary queue send, so replicas get their own id
/// and an independent lifecycle.
pub struct TopicEngine<'e, 't> {
    queues: &'e mut QueueEngine<'t>,
}

impl<'e, 't> TopicEngine<'e, 't> {
    pub fn new(queues: &'e mut QueueEngine<'t>) -> Self {
        Self { queues }
    }

    pub async fn find_topic(&mut self, name: &str) -> Result<Topic> {
        self.queues
            .transaction()
            .find_topic(name)
            .await?
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
    }

    /// Queues subscribed to `topic_name`, in subscription order.
    async fn subscribed_queues(&mut self, topic_name: &str) -> Result<Vec<Queue>> {
        let tx = self.queues.transaction();
        let subscriptions = tx.list_subscriptions(topic_name).await?;
        let mut queues = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            match tx.find_queue(&subscription.queue_name).await? {
                Some(queue) => queues.push(queue),
                None => tracing::warn!(
                    topic_name = %topic_name,
                    queue_name = %subscription.queue_name,
                    "Subscription points at a missing queue"
                ),
            }
        }
        Ok(queues)
    }

    /// Send one replica of the message to every subscribed queue.
    ///
    /// Sizes are checked against every queue before anything is written, so a
    /// rejected publish leaves no replicas behind.
    pub async fn publish(
        &mut self,
        topic_name: &str,
        body: Vec<u8>,
        options: SendMessageOptions,
    ) -> Result<PublishMessageResult> {
        self.find_topic(topic_name).await?;
        let queues = self.subscribed_queues(topic_name).await?;
        for queue in &queues {
            queue.check_message_size(body.len())?;
        }

        let mut deliveries = Vec::with_capacity(queues.len());
        for queue in &queues {
            let result = self
                .queues
                .send(queue, body.clone(), options.clone())
                .await?;
            deliveries.push(TopicDelivery {
                queue_name: queue.name.clone(),
                message_id: result.id,
            });
        }

        tracing::debug!(
            topic_name = %topic_name,
            replicas = deliveries.len(),
            "Message published"
        );
        Ok(PublishMessageResult { deliveries })
    }

    /// Fan a dead-lettered message out to the topic's queues.
    /// Returns `None` when the topic does not exist.
    pub(crate) async fn publish_copy(
        &mut self,
        topic_name: &str,
        source: &StoredMessage,
    ) -> Result<Option<usize>> {
        if self
            .queues
            .transaction()
            .find_topic(topic_name)
            .await?
            .is_none()
        {
            return Ok(None);
        }
        let queues = self.subscribed_queues(topic_name).await?;
        for queue in &queues {
            self.queues.insert_copy(queue, source).await?;
        }
        Ok(Some(queues.len()))
    }
}
