//! Error types for pool operations
use thiserror::Error;

/// Result type for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Error type for pool operations
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool has no capacity left and the wait (if any) elapsed.
    #[error("pool exhausted: {active}/{max_total} in use")]
    Exhausted {
        /// Objects currently checked out.
        active: usize,
        /// Configured capacity.
        max_total: usize,
    },

    /// The pool has been closed; no further borrows are served.
    #[error("pool is closed")]
    Closed,

    /// The object offered for return/invalidation is not currently
    /// checked out from this pool. Either it was already returned
    /// (duplicate event) or it never belonged here.
    #[error("object is not under pool management")]
    UnknownObject,

    /// A factory callback failed.
    #[error("factory {operation} failed: {source}")]
    Factory {
        /// Which lifecycle callback failed.
        operation: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Pool configuration is invalid
    #[error("configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },
}

impl PoolError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a factory-callback error
    pub fn factory<E>(operation: &'static str, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Factory {
            operation,
            source: source.into(),
        }
    }

    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
