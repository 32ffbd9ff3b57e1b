//! Compensation stack
//!
//! Every remote side effect of a multi-step operation registers how to undo
//! it. On failure the stack is unwound in reverse order; once the operation
//! succeeds it is disarmed.

use futures::future::BoxFuture;
use modman_types::Result;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Undo = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

pub struct CompensationStack {
    actions: Vec<(String, Undo)>,
    /// Limit for each undo action
    timeout: Duration,
}

impl CompensationStack {
    pub fn new(timeout: Duration) -> Self {
        Self {
            actions: Vec::new(),
            timeout,
        }
    }

    /// Register an undo action. It runs with a fresh token, so it still
    /// executes when the failed operation itself was canceled.
    pub fn push<F, Fut>(&mut self, description: impl Into<String>, undo: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.actions
            .push((description.into(), Box::new(move |token| Box::pin(undo(token)))));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Forget every registered action
    pub fn disarm(&mut self) {
        self.actions.clear();
    }

    /// Run every action, most recent first. Failures are logged and skipped.
    pub async fn unwind(&mut self) {
        while let Some((description, undo)) = self.actions.pop() {
            let token = CancellationToken::new();
            match tokio::time::timeout(self.timeout, undo(token.clone())).await {
                Ok(Ok(())) => debug!(action = %description, "Compensated"),
                Ok(Err(e)) => warn!(action = %description, error = %e, "Compensation failed"),
                Err(_) => {
                    token.cancel();
                    warn!(action = %description, "Compensation timed out");
                }
            }
        }
    }
}

impl Drop for CompensationStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(pending = self.actions.len(), "Compensation stack dropped while armed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modman_types::Error;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn record(stack: &mut CompensationStack, log: &Log, name: &'static str, fail: bool) {
        let log = log.clone();
        stack.push(name, move |_| async move {
            log.lock().unwrap().push(name);
            if fail {
                Err(Error::internal("engine unavailable"))
            } else {
                Ok(())
            }
        });
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_and_survives_failures() {
        let log = Log::default();
        let mut stack = CompensationStack::new(Duration::from_secs(1));
        record(&mut stack, &log, "remove volume", false);
        record(&mut stack, &log, "remove container a", true);
        record(&mut stack, &log, "remove container b", false);

        stack.unwind().await;
        assert!(stack.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["remove container b", "remove container a", "remove volume"]
        );
    }

    #[tokio::test]
    async fn test_disarm_skips_actions() {
        let log = Log::default();
        let mut stack = CompensationStack::new(Duration::from_secs(1));
        record(&mut stack, &log, "remove container", false);
        assert_eq!(stack.len(), 1);

        stack.disarm();
        stack.unwind().await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_action_times_out() {
        let mut stack = CompensationStack::new(Duration::from_millis(20));
        stack.push("stuck", |token| async move {
            token.cancelled().await;
            Ok(())
        });
        stack.unwind().await;
        assert!(stack.is_empty());
    }
}
