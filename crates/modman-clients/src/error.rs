//! Client error types

use modman_types::Error;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Collaborator client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was understood but refers to something unusable
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// The module dependency graph cannot be satisfied
    #[error("Unsatisfied dependency: {0}")]
    Dependency(String),

    #[error("Remote job {id} failed: {message}")]
    JobFailed { id: String, message: String },

    #[error("Operation canceled")]
    Canceled,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound(msg) => Error::NotFound(msg),
            ClientError::Invalid(msg) => Error::InvalidInput(msg),
            other => Error::Internal(other.to_string()),
        }
    }
}

/// Run `fut` until it finishes or `cancel` fires, whichever comes first
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Canceled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modman_types::ErrorKind;

    #[tokio::test]
    async fn test_cancellable_stops_pending_future() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: ClientResult<()> = cancellable(&cancel, std::future::pending()).await;
        assert!(matches!(res, Err(ClientError::Canceled)));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::from(ClientError::NotFound("x".into())).kind(), ErrorKind::NotFound);
        assert_eq!(Error::from(ClientError::Invalid("x".into())).kind(), ErrorKind::InvalidInput);
        assert_eq!(Error::from(ClientError::Canceled).kind(), ErrorKind::Internal);
    }
}
