//! Error types for the core.
//!
//! Only resource-exhaustion and configuration problems are errors. Rejected
//! transitions and failing observers are reported as values, never raised.

use thiserror::Error;

/// Error type collaborators return from listener and handler callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors propagated to the caller attempting an action.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("listener capacity exceeded: limit is {limit}")]
    ListenerCapacity { limit: usize },
    #[error("listener capacity for {subscription} exceeded: limit is {limit}")]
    SubscriptionCapacity { subscription: String, limit: usize },
    #[error("unknown mode: {0}")]
    UnknownMode(String),
    #[error("duplicate mode: {0}")]
    DuplicateMode(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
