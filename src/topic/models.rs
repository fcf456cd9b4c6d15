use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::queue::normalize_name;

pub(crate) fn validate_topic_name(name: &str) -> Result<String> {
    normalize_name(name).ok_or_else(|| BrokerError::InvalidTopicName(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub tags: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionProtocol {
    Queue,
}

impl SubscriptionProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionProtocol::Queue => "queue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queue" => Some(SubscriptionProtocol::Queue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub topic_name: String,
    pub protocol: SubscriptionProtocol,
    pub queue_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub tags: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub subscriptions: Vec<Subscription>,
}

/// One replica written by a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicDelivery {
    pub queue_name: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishMessageResult {
    pub deliveries: Vec<TopicDelivery>,
}

impl PublishMessageResult {
    pub fn message_id_for(&self, queue_name: &str) -> Option<&str> {
        self.deliveries
            .iter()
            .find(|d| d.queue_name == queue_name)
            .map(|d| d.message_id.as_str())
    }
}
