//! Channel errors

use thiserror::Error;

/// Channel errors
///
/// Every variant except [`ChannelError::DeadLetterNotFound`] is treated as
/// transient by producers and consumers.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    #[error("Dead letter not found: seq={0}")]
    DeadLetterNotFound(u64),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ChannelError::DeadLetterNotFound(_))
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;
