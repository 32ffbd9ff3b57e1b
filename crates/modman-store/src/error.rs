//! Storage errors

use modman_types::Error;
use thiserror::Error;

/// Storage-specific errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict (e.g., already exists)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown or failed transaction
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Backend unavailable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => Error::NotFound(msg),
            other => Error::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modman_types::ErrorKind;

    #[test]
    fn test_conversion_kinds() {
        assert_eq!(
            Error::from(StorageError::NotFound("deployment x".into())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::from(StorageError::Conflict("deployment x".into())).kind(),
            ErrorKind::Internal
        );
    }
}
