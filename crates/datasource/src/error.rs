//! Error types for data-source operations
use thiserror::Error;

use crate::source::ConnectionId;

/// Result type for data-source operations
pub type DataSourceResult<T> = std::result::Result<T, DataSourceError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for data-source operations.
///
/// Validation never appears here: it always resolves to a boolean and the
/// pool's own policy decides the consequence. Cleanup failures while
/// handling another error are logged and never surface over the primary.
#[derive(Error, Debug)]
pub enum DataSourceError {
    /// Conflicting or doubly-set construction parameters, or mutating a
    /// setting after the first connection was requested. Fail-fast,
    /// non-retryable.
    #[error("configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// A connection could not be acquired: pool exhausted, backend
    /// refused, or the rotation retry bound was exhausted.
    #[error("cannot borrow connection from pool: {reason}")]
    Acquisition {
        /// What failed.
        reason: String,
        /// The underlying failure, when there is one.
        #[source]
        source: Option<BoxError>,
    },

    /// The supplied password is genuinely wrong: a direct probe with it
    /// was rejected by the backend.
    #[error("given password did not match password used to create the pooled connection")]
    CredentialMismatch {
        /// The backend's rejection.
        #[source]
        source: BoxError,
    },

    /// A lifecycle event arrived for a connection with no tracked pool
    /// entry — a lifecycle invariant violation, never swallowed.
    #[error("no pooled entry recorded for connection {id}")]
    UnknownConnection {
        /// The untracked connection.
        id: ConnectionId,
    },

    /// A backend operation failed.
    #[error("backend error: {message}")]
    Backend {
        /// The error message
        message: String,
        /// The underlying failure, when there is one.
        #[source]
        source: Option<BoxError>,
    },

    /// An internal invariant does not hold.
    #[error("internal error: {message}")]
    Internal {
        /// The error message
        message: String,
    },
}

impl DataSourceError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an acquisition error without an underlying cause
    pub fn acquisition<S: Into<String>>(reason: S) -> Self {
        Self::Acquisition {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create an acquisition error wrapping an underlying cause
    pub fn acquisition_caused_by<S, E>(reason: S, source: E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        Self::Acquisition {
            reason: reason.into(),
            source: Some(source.into()),
        }
    }

    /// Create a credential-mismatch error wrapping the probe rejection
    pub fn credential_mismatch<E: Into<BoxError>>(source: E) -> Self {
        Self::CredentialMismatch {
            source: source.into(),
        }
    }

    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<cistern_pool::PoolError> for DataSourceError {
    fn from(err: cistern_pool::PoolError) -> Self {
        Self::acquisition_caused_by("pool operation failed", err)
    }
}
