//! Error types for the aggregate repository and command dispatch pipeline.

use eventweave_core::DomainError;
use eventweave_store::EventStoreError;
use thiserror::Error;

/// Error surfaced by [`crate::AggregateRepository::dispatch`].
///
/// Each domain and storage failure mode gets its own variant, with `From`
/// conversions so `?` composes cleanly through the dispatch pipeline.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Optimistic concurrency failure (stale aggregate version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Domain validation failure (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Domain invariant failure (deterministic).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Domain authorization failure.
    #[error("unauthorized")]
    Unauthorized,

    /// Domain-level not found.
    #[error("not found")]
    NotFound,

    /// Failed to deserialize historical event payloads into the aggregate's event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    /// Persisting to the event store failed for a reason other than concurrency.
    #[error("event store error: {0}")]
    Store(EventStoreError),

    /// Publication failed after a successful append (at-least-once; retry may duplicate).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for RepositoryError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => RepositoryError::Concurrency(msg.clone()),
            _ => RepositoryError::Store(value),
        }
    }
}

impl From<DomainError> for RepositoryError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => RepositoryError::Validation(msg),
            DomainError::InvariantViolation(msg) => RepositoryError::InvariantViolation(msg),
            DomainError::Conflict(msg) => RepositoryError::Concurrency(msg),
            DomainError::Unauthorized => RepositoryError::Unauthorized,
            DomainError::NotFound => RepositoryError::NotFound,
            DomainError::InvalidId(msg) => RepositoryError::Validation(msg),
        }
    }
}
