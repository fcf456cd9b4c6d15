use serde::Serialize;
use thiserror::Error;

/// Failures raised by a storage backend, independent of broker semantics.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A uniqueness constraint was violated. Carries the constraint or key name when known.
    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Converts driver-level unique violations into [`StorageError::Conflict`].
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                let constraint = db_err
                    .constraint()
                    .map(str::to_string)
                    .unwrap_or_else(|| db_err.message().to_string());
                return StorageError::Conflict(constraint);
            }
        }
        StorageError::Database(err)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Coarse classification of [`BrokerError`], used by protocol layers to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidReference,
    InvalidInput,
    Aborted,
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("queue \"{0}\" not found")]
    QueueNotFound(String),

    #[error("topic \"{0}\" not found")]
    TopicNotFound(String),

    #[error("message id \"{message_id}\" is invalid for queue \"{queue_name}\"")]
    MessageNotFound {
        queue_name: String,
        message_id: String,
    },

    #[error("subscription \"{0}\" not found")]
    SubscriptionNotFound(String),

    #[error("user \"{0}\" not found")]
    UserNotFound(String),

    #[error("queue \"{queue_name}\" already exists: {reason}")]
    QueueAlreadyExists { queue_name: String, reason: String },

    #[error("topic \"{topic_name}\" already exists: {reason}")]
    TopicAlreadyExists { topic_name: String, reason: String },

    #[error("user with username \"{0}\" already exists")]
    UsernameAlreadyExists(String),

    #[error("user with access key id \"{0}\" already exists")]
    AccessKeyIdAlreadyExists(String),

    #[error("receipt handle \"{receipt_handle}\" is invalid for queue \"{queue_name}\"")]
    ReceiptHandleIsInvalid {
        queue_name: String,
        receipt_handle: String,
    },

    #[error("message with deduplication id \"{deduplication_id}\" already exists in queue \"{queue_name}\"")]
    DuplicateMessage {
        queue_name: String,
        deduplication_id: String,
    },

    #[error("cannot delete dead letter queue \"{queue_name}\", associated with queue \"{referenced_by}\"")]
    DeleteDeadLetterQueue {
        queue_name: String,
        referenced_by: String,
    },

    #[error("cannot delete dead letter topic \"{topic_name}\", associated with queue \"{referenced_by}\"")]
    DeleteDeadLetterTopic {
        topic_name: String,
        referenced_by: String,
    },

    #[error("queue name \"{0}\" is invalid")]
    InvalidQueueName(String),

    #[error("topic name \"{0}\" is invalid")]
    InvalidTopicName(String),

    #[error("message of size {size} exceeded the maximum message size of {max}")]
    MessageExceededMaxMessageSize { size: usize, max: u64 },

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("invalid queue configuration: {0}")]
    InvalidQueueConfig(String),

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::QueueNotFound(_)
            | BrokerError::TopicNotFound(_)
            | BrokerError::MessageNotFound { .. }
            | BrokerError::SubscriptionNotFound(_)
            | BrokerError::UserNotFound(_) => ErrorKind::NotFound,

            BrokerError::QueueAlreadyExists { .. }
            | BrokerError::TopicAlreadyExists { .. }
            | BrokerError::UsernameAlreadyExists(_)
            | BrokerError::AccessKeyIdAlreadyExists(_) => ErrorKind::AlreadyExists,

            BrokerError::ReceiptHandleIsInvalid { .. }
            | BrokerError::DuplicateMessage { .. }
            | BrokerError::DeleteDeadLetterQueue { .. }
            | BrokerError::DeleteDeadLetterTopic { .. } => ErrorKind::InvalidReference,

            BrokerError::InvalidQueueName(_)
            | BrokerError::InvalidTopicName(_)
            | BrokerError::MessageExceededMaxMessageSize { .. }
            | BrokerError::InvalidUpdate(_)
            | BrokerError::InvalidQueueConfig(_) => ErrorKind::InvalidInput,

            BrokerError::Aborted(_) => ErrorKind::Aborted,

            BrokerError::PasswordHash(_) | BrokerError::Storage(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        BrokerError::Storage(StorageError::from_sqlx(err))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
