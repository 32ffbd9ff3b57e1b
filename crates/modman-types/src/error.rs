//! Shared error kinds
//!
//! Every crate in the workspace has its own error enum for its own concerns,
//! but anything surfaced to a caller of the orchestration engine is converted
//! into [`Error`], whose variants are the error *kinds* callers match on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of an orchestration error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Internal,
    ResourceBusy,
    Forbidden,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
            ErrorKind::ResourceBusy => "resource_busy",
            ErrorKind::Forbidden => "forbidden",
        };
        f.write_str(s)
    }
}

/// Orchestration error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied invalid data
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Failure inside the engine or one of its collaborators
    #[error("internal error: {0}")]
    Internal(String),

    /// The orchestration lease is held by another operation
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Error::ResourceBusy(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Internal(_) => ErrorKind::Internal,
            Error::ResourceBusy(_) => ErrorKind::ResourceBusy,
            Error::Forbidden(_) => ErrorKind::Forbidden,
        }
    }

    /// Message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            Error::NotFound(m)
            | Error::InvalidInput(m)
            | Error::Internal(m)
            | Error::ResourceBusy(m)
            | Error::Forbidden(m) => m,
        }
    }

    /// Prefix the message with an operation description, keeping the kind
    pub fn context(self, op: impl fmt::Display) -> Self {
        let wrap = |m: String| format!("{}: {}", op, m);
        match self {
            Error::NotFound(m) => Error::NotFound(wrap(m)),
            Error::InvalidInput(m) => Error::InvalidInput(wrap(m)),
            Error::Internal(m) => Error::Internal(wrap(m)),
            Error::ResourceBusy(m) => Error::ResourceBusy(wrap(m)),
            Error::Forbidden(m) => Error::Forbidden(wrap(m)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_kind() {
        let err = Error::invalid_input("config 'port' is required")
            .context("create deployment (module=broker)");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(
            err.message(),
            "create deployment (module=broker): config 'port' is required"
        );
    }

    #[test]
    fn test_display_includes_kind() {
        let err = Error::busy("lease held by 'delete deployment'");
        assert_eq!(
            err.to_string(),
            "resource busy: lease held by 'delete deployment'"
        );
    }
}
