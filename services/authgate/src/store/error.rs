//! Lookup store error types.

use thiserror::Error;

/// Lookup store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (connect, I/O, pool exhaustion).
    #[error("lookup store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// The store answered but the query failed.
    #[error("lookup query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// The store returned a row that cannot be turned into a route.
    #[error("invalid host record for account '{account}': {reason}")]
    InvalidRecord { account: String, reason: String },
}

impl StoreError {
    /// Classify a driver error as a connectivity or a query failure.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err),
            other => Self::Query(other),
        }
    }

    /// Whether the failure is a connectivity problem worth one more attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
