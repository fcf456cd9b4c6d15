//! Queues and the message lifecycle.
//!
//! - [`models`]: queue configuration, records and info snapshots
//! - [`message`]: message types and per-operation options
//! - [`engine`]: the delivery state machine, run inside a storage transaction

pub mod engine;
pub mod message;
pub mod models;

pub use engine::{QueueEngine, Release, ScheduledWake, SweepResult};
pub use message::{
    DeleteMessageEntry, DeleteMessageError, DeleteMessageOutcome, DeleteMessagesResult, Message,
    MessageState, MoveMessagesResult, PeekMessagesOptions, ReceiveMessagesOptions,
    SendMessageEntry, SendMessageOptions, SendMessageResult, UpdateMessageOptions,
};
pub(crate) use models::{normalize_name, validate_queue_name};
pub use models::{
    DeadLetterTarget, MessageCounts, NakExpireBehavior, Queue, QueueConfig, QueueInfo, DEFAULT_MAX_NUMBER_OF_MESSAGES,
    DEFAULT_VISIBILITY_TIMEOUT_MS,
};
