//! Error types for saga persistence

use crate::SagaId;

/// Error returned by [`SagaStore`](crate::SagaStore) and
/// [`DispatchQueue`](crate::DispatchQueue) operations
#[derive(Debug, thiserror::Error)]
pub enum SagaStoreError {
    /// Malformed input - caller bug, never retried automatically
    #[error("Invalid input: {0}")]
    Validation(Box<str>),
    /// Lost a compare-and-swap race - re-fetch the saga and retry
    #[error("Concurrency conflict on saga {saga_id}")]
    Concurrency {
        /// Saga whose write was rejected
        saga_id: SagaId,
    },
    /// Transport or service failure from the storage backend
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Operation deliberately not supported by the store
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl SagaStoreError {
    pub(crate) fn validation(reason: impl Into<Box<str>>) -> Self {
        Self::Validation(reason.into())
    }

    /// Check if the caller should re-read the saga and retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }

    /// Check if this is an optimistic concurrency failure
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

/// Error from a storage backend
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// A conditional write or update was rejected
    #[error("Condition check failed")]
    ConditionFailed,
    /// The saga table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(Box<str>),
    /// Underlying storage failure
    #[error("Storage error: {0}")]
    Storage(Box<str>),
    /// A stored record could not be converted
    #[error("Codec error: {0}")]
    Codec(Box<str>),
}

impl BackendError {
    pub(crate) fn storage(error: impl std::fmt::Display) -> Self {
        Self::Storage(error.to_string().into())
    }

    pub(crate) fn codec(error: impl std::fmt::Display) -> Self {
        Self::Codec(error.to_string().into())
    }
}
