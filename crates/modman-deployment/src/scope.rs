//! Call scopes
//!
//! A [`CallScope`] is created at the top of every lifecycle operation. All
//! storage and collaborator calls of that operation run through it, bounded
//! by their own timeout and by the scope's cancellation token. Dropping the
//! scope cancels whatever is still outstanding.

use modman_types::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-call time limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub database: Duration,
    pub http: Duration,
    /// Time a timed-out call gets to observe its cancellation
    pub grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            database: Duration::from_secs(15),
            http: Duration::from_secs(120),
            grace: Duration::from_secs(2),
        }
    }
}

pub struct CallScope {
    token: CancellationToken,
    timeouts: Timeouts,
}

impl CallScope {
    /// Scope bound to `parent`, usually the job's token
    pub fn new(parent: &CancellationToken, timeouts: Timeouts) -> Self {
        Self {
            token: parent.child_token(),
            timeouts,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail if the operation was canceled
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::internal("operation canceled"))
        } else {
            Ok(())
        }
    }

    /// Run a storage call
    pub async fn db<T, E, Fut>(&self, op: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::internal(format!("{}: canceled", op))),
            res = tokio::time::timeout(self.timeouts.database, fut) => match res {
                Ok(res) => res.map_err(|e| Into::<Error>::into(e).context(op)),
                Err(_) => Err(Error::internal(format!(
                    "{}: timed out after {:?}",
                    op, self.timeouts.database
                ))),
            },
        }
    }

    /// Run a collaborator call; `call` receives the token it must observe
    pub async fn http<T, E, F, Fut>(&self, op: &str, call: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        let token = self.token.child_token();
        let fut = call(token.clone());
        tokio::pin!(fut);

        match tokio::time::timeout(self.timeouts.http, &mut fut).await {
            Ok(res) => res.map_err(|e| Into::<Error>::into(e).context(op)),
            Err(_) => {
                token.cancel();
                if tokio::time::timeout(self.timeouts.grace, &mut fut)
                    .await
                    .is_err()
                {
                    warn!(op = %op, "Call did not finish within the grace period");
                }
                Err(Error::internal(format!(
                    "{}: timed out after {:?}",
                    op, self.timeouts.http
                )))
            }
        }
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modman_types::ErrorKind;

    fn short() -> Timeouts {
        Timeouts {
            database: Duration::from_millis(50),
            http: Duration::from_millis(50),
            grace: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_error_keeps_kind_and_gains_context() {
        let scope = CallScope::new(&CancellationToken::new(), short());
        let err = scope
            .db("read deployment", async {
                Err::<(), _>(Error::not_found("deployment 1"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), "read deployment: deployment 1");
    }

    #[tokio::test]
    async fn test_http_timeout_cancels_call_token() {
        let scope = CallScope::new(&CancellationToken::new(), short());
        let (tx, rx) = tokio::sync::oneshot::channel();

        let err = scope
            .http("stop container", |token| async move {
                token.cancelled().await;
                let _ = tx.send(());
                Err::<(), _>(Error::internal("canceled"))
            })
            .await
            .unwrap_err();

        assert!(err.message().contains("timed out"));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_cancels_children() {
        let parent = CancellationToken::new();
        let scope = CallScope::new(&parent, short());
        let child = scope.token().child_token();
        drop(scope);
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancellation_fails_db_calls() {
        let parent = CancellationToken::new();
        let scope = CallScope::new(&parent, short());
        parent.cancel();

        assert!(scope.check().is_err());
        let err = scope
            .db("list deployments", std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(err.message().contains("canceled"));
    }
}
