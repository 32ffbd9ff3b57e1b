//! Orchestration lease
//!
//! A process-wide reader/writer lock acquired without waiting. Mutating
//! operations take it exclusively, reads take it shared. Guards are owned,
//! so they can be moved into a spawned job and outlive the request that
//! acquired them.

use modman_types::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

#[derive(Clone, Default)]
pub struct OrchestrationLease {
    lock: Arc<RwLock<()>>,
    /// Reason given by the current exclusive holder
    holder: Arc<Mutex<Option<String>>>,
}

enum Held {
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
}

/// Proof of holding the lease; released on [`release`](Self::release) or drop
pub struct LeaseGuard {
    held: Held,
    holder: Arc<Mutex<Option<String>>>,
}

impl OrchestrationLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire_exclusive(&self, reason: impl Into<String>) -> Result<LeaseGuard> {
        let guard = self
            .lock
            .clone()
            .try_write_owned()
            .map_err(|_| self.busy())?;
        let reason = reason.into();
        debug!(reason = %reason, "Exclusive lease acquired");
        *self.holder.lock() = Some(reason);
        Ok(LeaseGuard {
            held: Held::Exclusive(guard),
            holder: self.holder.clone(),
        })
    }

    pub fn try_acquire_shared(&self) -> Result<LeaseGuard> {
        let guard = self
            .lock
            .clone()
            .try_read_owned()
            .map_err(|_| self.busy())?;
        Ok(LeaseGuard {
            held: Held::Shared(guard),
            holder: self.holder.clone(),
        })
    }

    /// Reason of the current exclusive holder, if any
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }

    fn busy(&self) -> Error {
        match self.holder() {
            Some(reason) => Error::busy(format!("another operation is in progress: {}", reason)),
            None => Error::busy("another operation is in progress"),
        }
    }
}

impl LeaseGuard {
    pub fn is_exclusive(&self) -> bool {
        matches!(self.held, Held::Exclusive(_))
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // Runs before the lock guard field is dropped
        if self.is_exclusive() {
            *self.holder.lock() = None;
            debug!("Exclusive lease released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modman_types::ErrorKind;

    #[test]
    fn test_exclusive_blocks_everything() {
        let lease = OrchestrationLease::new();
        let guard = lease.try_acquire_exclusive("delete deployment 42").unwrap();

        let err = lease.try_acquire_exclusive("start deployment").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        assert!(err.message().contains("delete deployment 42"));
        assert!(lease.try_acquire_shared().is_err());

        guard.release();
        assert!(lease.holder().is_none());
        assert!(lease.try_acquire_exclusive("start deployment").is_ok());
    }

    #[test]
    fn test_shared_allows_readers_only() {
        let lease = OrchestrationLease::new();
        let a = lease.try_acquire_shared().unwrap();
        let b = lease.try_acquire_shared().unwrap();
        assert!(!a.is_exclusive());
        assert!(lease.try_acquire_exclusive("update").is_err());

        drop(a);
        drop(b);
        assert!(lease.try_acquire_exclusive("update").is_ok());
    }

    #[tokio::test]
    async fn test_guard_moves_into_task() {
        let lease = OrchestrationLease::new();
        let guard = lease.try_acquire_exclusive("create deployment").unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let _ = rx.await;
        });
        assert!(lease.try_acquire_exclusive("other").is_err());

        tx.send(()).unwrap();
        task.await.unwrap();
        assert!(lease.try_acquire_exclusive("other").is_ok());
    }
}
