//! Pub/sub topics that fan out into queues.

mod engine;
mod models;

pub use engine::TopicEngine;
pub(crate) use models::validate_topic_name;
pub use models::{
    PublishMessageResult, Subscription, SubscriptionProtocol, Topic, TopicDelivery, TopicInfo,
};
