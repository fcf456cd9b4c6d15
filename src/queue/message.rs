use std::borrow::Cow;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signal::AbortSignal;

/// Delivery state of a message at a given instant.
///
/// ```text
/// Delayed -> Available -> NotVisible -> Available (nak / timeout)
///                                    -> deleted (ack)
///                                    -> dead-lettered (receive count > max)
/// ```
///
/// `Expired` (retention elapsed) can be reached from any state and is never
/// returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Delayed,
    Available,
    NotVisible,
    Expired,
}

/// A message as seen by callers of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub priority: i64,
    pub sent_at: DateTime<Utc>,
    pub delay_until: Option<DateTime<Utc>>,
    /// Retention deadline
    pub expires_at: Option<DateTime<Utc>>,
    pub receive_count: u32,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_nak_reason: Option<String>,
    /// Present only while the message is not visible
    pub receipt_handle: Option<String>,
    /// End of the current visibility timeout, while not visible
    pub not_visible_until: Option<DateTime<Utc>>,
    pub state: MessageState,
}

impl Message {
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendMessageOptions {
    pub attributes: HashMap<String, String>,
    pub delay_ms: Option<u64>,
    /// Higher is delivered first
    pub priority: i64,
    /// Rejects the send while an unacknowledged message carries the same id
    pub deduplication_id: Option<String>,
}

impl SendMessageOptions {
    pub fn with_priority(priority: i64) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendMessageResult {
    pub id: String,
}

/// One item of a batch send.
#[derive(Debug, Clone, Default)]
pub struct SendMessageEntry {
    pub body: Vec<u8>,
    pub options: SendMessageOptions,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveMessagesOptions {
    pub max_number_of_messages: Option<usize>,
    pub visibility_timeout_ms: Option<u64>,
    /// Long-poll wait; falls back to the queue default
    pub wait_time_ms: Option<u64>,
    pub abort: Option<AbortSignal>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeekMessagesOptions {
    pub max_number_of_messages: Option<usize>,
    pub include_not_visible: bool,
    pub include_delayed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateMessageOptions {
    pub priority: Option<i64>,
    pub attributes: Option<HashMap<String, String>>,
    /// Requires a receipt handle; zero behaves like a nak
    pub visibility_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MoveMessagesResult {
    pub moved_message_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMessageError {
    MessageNotFound,
    ReceiptHandleIsInvalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteMessageOutcome {
    pub deleted: bool,
    pub error: Option<DeleteMessageError>,
    pub error_message: Option<String>,
}

/// One item of a batch delete.
#[derive(Debug, Clone)]
pub struct DeleteMessageEntry {
    pub id: String,
    pub receipt_handle: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteMessagesResult {
    pub messages: HashMap<String, DeleteMessageOutcome>,
}

impl DeleteMessagesResult {
    pub fn deleted_count(&self) -> usize {
        self.messages.values().filter(|o| o.deleted).count()
    }
}
