//! Error types for the storage crate.

use thiserror::Error;

pub use chirpha_core::error::Error as CoreError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend could not be reached (connect failure or timeout).
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Backend answered a query with an error.
    #[error("Backend query failed: {0}")]
    QueryFailed(String),

    /// Backend rejected a write.
    #[error("Backend write failed: {0}")]
    WriteFailed(String),

    /// Response body could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<Error> for CoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::Unavailable(_) | Error::QueryFailed(_) | Error::WriteFailed(_) => {
                CoreError::Storage(e.to_string())
            }
            Error::Serialization(s) => CoreError::Serialization(s),
            Error::InvalidInput(s) => CoreError::Validation(s),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Serialization(format!("CSV error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_to_core_error() {
        let core: CoreError = Error::Unavailable("connection refused".into()).into();
        assert!(matches!(core, CoreError::Storage(ref s) if s.contains("connection refused")));

        let core: CoreError = Error::InvalidInput("empty measurement".into()).into();
        assert!(matches!(core, CoreError::Validation(_)));
    }
}
