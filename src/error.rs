//! Error taxonomy for the relay.
//!
//! Per-image errors ([`ImageError`]) are absorbed by the worker's image loop.
//! Only [`RepositoryError`] escalates to a requeue of the whole message, and a
//! [`ParseError`] discards the message for good.

use thiserror::Error;

/// The queue body is not a valid processing request.
#[derive(Debug, Error)]
#[error("malformed processing message: {0}")]
pub struct ParseError(#[from] pub serde_json::Error);

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
}

#[derive(Debug, Error)]
#[error("failed to store object {key}: {reason}")]
pub struct StorageError {
    pub key: String,
    pub reason: String,
}

/// Failure of one image reference within a message.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("transcode task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("catalog record {id} not found (owner {owner_id:?})")]
    NotFound { id: i64, owner_id: Option<i64> },
    #[error("conflicting catalog write: {0}")]
    Conflict(String),
    #[error("invalid catalog record: {0}")]
    Invalid(String),
    #[error("catalog operation timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        let conflict = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| is_conflict_code(&code));
        if conflict {
            RepositoryError::Conflict(err.to_string())
        } else {
            RepositoryError::Database(err)
        }
    }
}

/// Integrity violations (class 23) and transaction rollbacks such as
/// serialization failures and deadlocks (class 40).
pub(crate) fn is_conflict_code(sqlstate: &str) -> bool {
    sqlstate.starts_with("23") || sqlstate.starts_with("40")
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("queue is closed")]
    Closed,
    #[error("delivery {0} is not held under this lease")]
    UnknownDelivery(i64),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize processing request: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to publish processing request: {0}")]
    Queue(#[from] QueueError),
}
