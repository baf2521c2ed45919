//! Error types module
//!
//! One enum per failure domain of the scan pipeline:
//!
//! - [`ChannelError`]: broker unreachable, channel closed, publish not accepted
//! - [`QueueError`]: publish failed after all retry attempts (surfaced to callers)
//! - [`MessageError`]: scan message could not be encoded or decoded (poison)
//! - [`FetchError`]: file content could not be retrieved in time
//! - [`ClassifyError`]: the classifier could not produce a verdict
//! - [`StoreError`]: record store read or write failed
//! - [`ScanError`]: everything that can go wrong while handling one delivery
//!
//! The `Database` variants and the `From<sqlx::Error>` conversions are gated behind
//! the `sqlx` feature.

use crate::models::FileId;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Channel is closed")]
    Closed,

    #[error("Broker did not accept the message")]
    NotSent,

    #[error("Queue not declared: {0}")]
    QueueNotDeclared(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    #[cfg(feature = "sqlx")]
    #[error("Broker database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Queue {queue} already declared with different options: {detail}")]
    QueueMismatch { queue: String, detail: String },
}

impl ChannelError {
    /// Errors after which the current connection must be dropped and re-established.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ChannelError::Connection(_) | ChannelError::Closed)
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for ChannelError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => ChannelError::Connection(err.to_string()),
            other => ChannelError::Database(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to queue file {file_id} after {attempts} attempts: {source}")]
    Exhausted {
        file_id: FileId,
        attempts: u32,
        #[source]
        source: ChannelError,
    },

    #[error("Failed to encode scan message: {0}")]
    Encode(#[from] MessageError),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed scan message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Failed to encode scan message: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Fetch timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Fetch failed with HTTP status {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Classifier timed out")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("File record not found: {0}")]
    NotFound(FileId),

    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid stored value: {0}")]
    Corrupt(String),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

/// Failure while handling a single scan delivery.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Malformed(#[from] MessageError),

    #[error("Content unavailable: {0}")]
    Fetch(#[from] FetchError),

    #[error("Classification failed: {0}")]
    Classify(#[from] ClassifyError),

    #[error("Record store write failed: {0}")]
    Store(#[from] StoreError),
}

impl ScanError {
    /// Poison messages can never succeed, whatever the number of retries.
    pub fn is_poison(&self) -> bool {
        matches!(self, ScanError::Malformed(_))
    }
}
