//! Sync errors

use shared::EnvelopeError;
use shared::error::{AppError, ErrorCode};
use thiserror::Error;

use crate::storage::StorageError;

/// Consumer-side failures
///
/// Stale envelopes are not errors; they show up as counts in the report.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Store or upstream unavailable, worth retrying
    #[error("transient sync failure: {0}")]
    Transient(String),

    /// Can never succeed, dead-letter without retry
    #[error("poison message: {0}")]
    Poison(String),

    #[error("user not found: {0}")]
    UserNotFound(String),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Transient(err.to_string())
    }
}

impl From<EnvelopeError> for SyncError {
    fn from(err: EnvelopeError) -> Self {
        SyncError::Poison(err.to_string())
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::UserNotFound(id) => AppError::user_not_found(&id),
            SyncError::Transient(msg) => AppError::upstream_unavailable(msg),
            SyncError::Poison(msg) => AppError::with_message(ErrorCode::EnvelopeInvalid, msg),
        }
    }
}
