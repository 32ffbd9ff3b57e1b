//! Job engine
//!
//! Jobs are spawned immediately but only run once a worker permit is
//! available. Each job gets a child of the engine's cancellation token;
//! cancellation is cooperative, the work decides when to observe it.

use chrono::Utc;
use dashmap::DashMap;
use modman_types::{Error, Job, JobError, JobFilter, JobId, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Job engine configuration
#[derive(Debug, Clone)]
pub struct JobEngineConfig {
    /// Maximum number of jobs running at the same time
    pub workers: usize,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

struct JobEntry {
    job: Job,
    token: CancellationToken,
}

/// Tracks and runs orchestration jobs
pub struct JobEngine {
    jobs: Arc<DashMap<JobId, JobEntry>>,
    permits: Arc<Semaphore>,
    finished: Arc<Notify>,
    shutdown: CancellationToken,
}

impl Default for JobEngine {
    fn default() -> Self {
        Self::new(JobEngineConfig::default())
    }
}

impl JobEngine {
    pub fn new(config: JobEngineConfig) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            finished: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a job and schedule `work`; returns without waiting for it
    pub fn create<F, Fut>(&self, description: impl Into<String>, work: F) -> Result<JobId>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::internal("job engine is shut down"));
        }

        let job = Job::new(description);
        let id = job.id.clone();
        let token = self.shutdown.child_token();
        debug!(job_id = %id, description = %job.description, "Job created");
        self.jobs.insert(
            id.clone(),
            JobEntry {
                job,
                token: token.clone(),
            },
        );

        let jobs = self.jobs.clone();
        let permits = self.permits.clone();
        let finished = self.finished.clone();
        let job_id = id.clone();

        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit,
                _ = token.cancelled() => {
                    debug!(job_id = %job_id, "Job canceled before start");
                    finished.notify_waiters();
                    return;
                }
            };
            let Ok(_permit) = permit else {
                return;
            };
            if token.is_cancelled() {
                finished.notify_waiters();
                return;
            }

            if let Some(mut entry) = jobs.get_mut(&job_id) {
                entry.job.started = Some(Utc::now());
            }
            info!(job_id = %job_id, "Job started");

            let result = work(token).await;

            if let Some(mut entry) = jobs.get_mut(&job_id) {
                entry.job.completed = Some(Utc::now());
                entry.job.error = result.as_ref().err().map(JobError::from);
            }
            match result {
                Ok(()) => info!(job_id = %job_id, "Job completed"),
                Err(e) => warn!(job_id = %job_id, error = %e, "Job failed"),
            }
            finished.notify_waiters();
        });

        Ok(id)
    }

    pub fn get(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| Error::not_found(format!("job {}", id)))
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|e| filter.matches(&e.job))
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created);
        if filter.sort_desc {
            jobs.reverse();
        }
        jobs
    }

    /// Request cooperative cancellation; a no-op for finished jobs
    pub fn cancel(&self, id: &JobId) -> Result<()> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("job {}", id)))?;
        if entry.job.is_terminal() {
            return Ok(());
        }
        entry.token.cancel();
        entry.job.canceled = Some(Utc::now());
        drop(entry);

        info!(job_id = %id, "Job canceled");
        self.finished.notify_waiters();
        Ok(())
    }

    /// Remove finished jobs older than `max_age`; returns how many were removed
    pub fn purge(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now() - max_age;
        let before = self.jobs.len();
        self.jobs.retain(|_, e| {
            !(e.job.is_terminal() && e.job.finished_at().is_some_and(|t| t < cutoff))
        });
        let purged = before.saturating_sub(self.jobs.len());
        if purged > 0 {
            debug!(purged, "Purged finished jobs");
        }
        purged
    }

    /// Run [`purge`](Self::purge) every `interval` until shutdown
    pub fn spawn_purge_loop(self: Arc<Self>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let engine = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        engine.purge(max_age);
                    }
                }
            }
            debug!("Job purge loop stopped");
        })
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, id: &JobId) -> Result<Job> {
        loop {
            let notified = self.finished.notified();
            let job = self.get(id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            notified.await;
        }
    }

    /// Cancel every job and refuse new ones
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let now = Utc::now();
        for mut entry in self.jobs.iter_mut() {
            if !entry.job.is_terminal() {
                entry.job.canceled = Some(now);
            }
        }
        self.finished.notify_waiters();
        info!("Job engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modman_types::{ErrorKind, JobStatus};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_job_completes() {
        let engine = JobEngine::default();
        let id = engine
            .create("start deployment", |_| async { Ok(()) })
            .unwrap();

        let job = engine.wait(&id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.started.is_some());
    }

    #[tokio::test]
    async fn test_job_error_recorded() {
        let engine = JobEngine::default();
        let id = engine
            .create("delete deployment", |_| async {
                Err(Error::invalid_input("deployment is required by others"))
            })
            .unwrap();

        let job = engine.wait(&id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Error);
        let error = job.error.unwrap();
        assert_eq!(error.kind, ErrorKind::InvalidInput);
        assert_eq!(error.message, "deployment is required by others");
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let engine = JobEngine::default();
        let id = engine
            .create("update deployment", |token| async move {
                token.cancelled().await;
                Err(Error::internal("canceled"))
            })
            .unwrap();

        // Let the job start
        while engine.get(&id).unwrap().started.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine.cancel(&id).unwrap();

        let job = engine.wait(&id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_pending_job_canceled_never_runs() {
        let engine = JobEngine::new(JobEngineConfig { workers: 1 });
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let blocker = engine
            .create("blocker", |_| async move {
                gate.notified().await;
                Ok(())
            })
            .unwrap();
        while engine.get(&blocker).unwrap().started.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let queued = engine
            .create("queued", |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        engine.cancel(&queued).unwrap();
        release.notify_one();

        engine.wait(&blocker).await.unwrap();
        let job = engine.wait(&queued).await.unwrap();
        assert_eq!(job.status(), JobStatus::Canceled);
        assert!(job.started.is_none());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_finished() {
        let engine = JobEngine::default();
        assert!(engine.cancel(&JobId::generate()).unwrap_err().is_not_found());

        let id = engine.create("noop", |_| async { Ok(()) }).unwrap();
        engine.wait(&id).await.unwrap();
        engine.cancel(&id).unwrap();
        assert_eq!(engine.get(&id).unwrap().status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_and_purge() {
        let engine = JobEngine::default();
        let first = engine.create("first", |_| async { Ok(()) }).unwrap();
        engine.wait(&first).await.unwrap();
        let second = engine.create("second", |_| async { Ok(()) }).unwrap();
        engine.wait(&second).await.unwrap();

        let desc = engine.list(&JobFilter {
            sort_desc: true,
            ..Default::default()
        });
        assert_eq!(desc.len(), 2);
        assert!(desc[0].created >= desc[1].created);

        let completed = engine.list(&JobFilter {
            status: Some(JobStatus::Completed),
            ..Default::default()
        });
        assert_eq!(completed.len(), 2);

        assert_eq!(engine.purge(Duration::from_secs(3600)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.purge(Duration::from_millis(1)), 2);
        assert!(engine.list(&JobFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_jobs() {
        let engine = JobEngine::default();
        engine.shutdown();
        assert!(engine.create("late", |_| async { Ok(()) }).is_err());
    }
}
