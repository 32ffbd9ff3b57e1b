//! Job types
//!
//! A job tracks one unit of asynchronous orchestration work. Its status is
//! derived from the recorded timestamps rather than stored separately.

use crate::error::{Error, ErrorKind};
use crate::ids::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub description: String,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub canceled: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: JobId::generate(),
            description: description.into(),
            created: Utc::now(),
            started: None,
            completed: None,
            canceled: None,
            error: None,
        }
    }

    /// Cancellation wins over completion: a canceled job stays canceled even
    /// if its work finished afterwards.
    pub fn status(&self) -> JobStatus {
        if self.canceled.is_some() {
            JobStatus::Canceled
        } else if self.completed.is_some() {
            if self.error.is_some() {
                JobStatus::Error
            } else {
                JobStatus::Completed
            }
        } else if self.started.is_some() {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Time the job reached a terminal state
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.canceled.or(self.completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Canceled
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Error recorded on a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for JobError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub status: Option<JobStatus>,
    /// Only jobs created at or after this time
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Only jobs created before this time
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    /// Newest first when set
    #[serde(default)]
    pub sort_desc: bool,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status() == s)
            && self.since.map_or(true, |t| job.created >= t)
            && self.until.map_or(true, |t| job.created < t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derivation() {
        let mut job = Job::new("start deployment");
        assert_eq!(job.status(), JobStatus::Pending);

        job.started = Some(Utc::now());
        assert_eq!(job.status(), JobStatus::Running);

        job.completed = Some(Utc::now());
        assert_eq!(job.status(), JobStatus::Completed);

        job.error = Some(JobError::from(&Error::internal("boom")));
        assert_eq!(job.status(), JobStatus::Error);
        assert!(job.is_terminal());
    }

    #[test]
    fn test_canceled_is_terminal_regardless_of_completion() {
        let mut job = Job::new("delete deployment");
        job.started = Some(Utc::now());
        job.canceled = Some(Utc::now());
        job.completed = Some(Utc::now());
        assert_eq!(job.status(), JobStatus::Canceled);
    }

    #[test]
    fn test_filter_window() {
        let job = Job::new("stop deployment");
        let filter = JobFilter {
            since: Some(job.created - chrono::Duration::seconds(1)),
            until: Some(job.created + chrono::Duration::seconds(1)),
            status: Some(JobStatus::Pending),
            sort_desc: false,
        };
        assert!(filter.matches(&job));

        let later = JobFilter {
            since: Some(job.created + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!later.matches(&job));
    }
}
