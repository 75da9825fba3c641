//! Error types for lease operations.
//!
//! Callers can tell apart a key that doesn't exist, an exhausted pool, and
//! transient failures (store trouble or conflict storms) that are worth
//! retrying, without knowing which store backend is in use.

use key_store::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaseError<E> {
    /// The key was never created, was deleted, or its lifetime ran out.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Every key in the pool is currently leased.
    #[error("no free key available")]
    NoFreeKey,

    /// The backing store errored or timed out.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] E),

    /// A conditional write kept losing to concurrent writers.
    #[error("conflict retries exhausted for key {key} after {attempts} attempts")]
    ConflictRetryExhausted { key: String, attempts: u32 },

    /// A record failed validation and was not written.
    #[error("invalid record: {0}")]
    InvalidRecord(CodecError),
}

impl<E> LeaseError<E> {
    /// true for failures that may succeed if the whole operation is retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeaseError::StoreUnavailable(_) | LeaseError::ConflictRetryExhausted { .. }
        )
    }

    /// true if the caller referenced something that isn't there: an unknown
    /// key, or an empty pool
    pub fn is_not_found(&self) -> bool {
        matches!(self, LeaseError::NotFound(_) | LeaseError::NoFreeKey)
    }
}
