//! Common error types for interpd

use thiserror::Error;

/// Common result type for interpd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy across the assignment engine.
///
/// Conflict, concurrency, and corruption errors are handled locally by the
/// engine (next candidate, bounded retry, repair/purge) and never abort a
/// batch. Infrastructure errors (`Database`, `LockTimeout`) abort the
/// current unit of work only.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed policy/threshold input, rejected synchronously
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Scheduling overlap detected for a candidate
    #[error("Schedule conflict: {0}")]
    Conflict(String),

    /// Lost race on commit (booking assigned by a concurrent run)
    #[error("Concurrent modification: {0}")]
    Concurrency(String),

    /// Pool/booking data inconsistency
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Advisory lock could not be obtained within the bounded wait
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Internal engine error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry with backoff is worth attempting.
    ///
    /// Database busy/locked conditions and lost commit races are transient;
    /// validation, corruption, and not-found are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => {
                let msg = e.to_string();
                msg.contains("locked") || msg.contains("busy") || msg.contains("timed out")
            }
            Error::Concurrency(_) | Error::LockTimeout(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_errors_are_transient() {
        assert!(Error::Concurrency("lost race".into()).is_transient());
        assert!(Error::LockTimeout("capacity".into()).is_transient());
    }

    #[test]
    fn validation_errors_are_not_transient() {
        assert!(!Error::Validation("bad penalty".into()).is_transient());
        assert!(!Error::Corruption("orphan entry".into()).is_transient());
        assert!(!Error::NotFound("booking".into()).is_transient());
    }
}
