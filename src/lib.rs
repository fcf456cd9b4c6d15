// Shared infrastructure
pub mod config;
pub mod error;
pub mod telemetry;

// Concurrency primitives
pub mod clock;
pub mod signal;

// Storage layer
pub mod storage;

// Domain layer (message lifecycle, fan-out, credentials)
pub mod queue;
pub mod topic;
pub mod user;

// Facade
pub mod store;

pub use error::{BrokerError, ErrorKind, Result, StorageError};
pub use store::{PollSummary, Store, StoreOptions};
