//! Error types for the egress limiter.

use thiserror::Error;

use crate::ratelimit::LimitExceeded;
use crate::store::StoreError;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// A resource is over its budget for the current bucket
    #[error(transparent)]
    LimitExceeded(#[from] LimitExceeded),

    /// The counter store failed
    #[error("store error during {op} for {resource}: {source}")]
    Store {
        /// Store operation that failed
        op: &'static str,
        /// Resource (counter key) involved
        resource: String,
        /// Underlying backend error
        #[source]
        source: StoreError,
    },

    /// No resource is registered under the name
    #[error("resource {0:?} not found")]
    NotFound(String),

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Wrap a store failure, keeping cancellation distinct.
    pub(crate) fn store(op: &'static str, resource: &str, source: StoreError) -> Self {
        match source {
            StoreError::Cancelled => LimiterError::Cancelled,
            source => LimiterError::Store {
                op,
                resource: resource.to_string(),
                source,
            },
        }
    }

    /// Whether this error is a limit rejection, without inspecting details.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, LimiterError::LimitExceeded(_))
    }

    /// Whether this error comes from cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LimiterError::Cancelled)
    }

    /// The rejection details, if this is a limit rejection.
    pub fn as_limit_exceeded(&self) -> Option<&LimitExceeded> {
        match self {
            LimiterError::LimitExceeded(exceeded) => Some(exceeded),
            _ => None,
        }
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
