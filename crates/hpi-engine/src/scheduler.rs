//! The scheduler client contract.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::JobStatus;
use crate::request::SubmissionRequest;

/// An error reported by a scheduler client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The scheduler rejected the request.
    #[error("{0}")]
    Rejected(String),
    /// The scheduler does not know the job.
    #[error("unknown job `{0}`")]
    UnknownJob(String),
    /// The scheduler could not be reached or answered unexpectedly.
    #[error("{0}")]
    Unavailable(String),
    /// The request may have reached the scheduler, but no answer came back.
    ///
    /// Only reported by submissions: the job may be queued even though no id
    /// is known for it.
    #[error("{0}")]
    Unconfirmed(String),
}

/// The status of a job as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerReport {
    /// The job status.
    pub status: JobStatus,
    /// The exit code, once known.
    pub exit_code: Option<i32>,
}

impl SchedulerReport {
    /// Creates a report without an exit code.
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            exit_code: None,
        }
    }
}

/// A client of a batch scheduler.
///
/// The job script and directory have been written by the time
/// [`submit`](Self::submit) is called.
#[async_trait]
pub trait SchedulerClient: fmt::Debug + Send + Sync {
    /// Submits a job and returns the scheduler-assigned job id.
    async fn submit(&self, request: &SubmissionRequest) -> Result<String, SchedulerError>;

    /// Queries the status of a job.
    async fn status(&self, job_id: &str) -> Result<SchedulerReport, SchedulerError>;

    /// Requests cancellation of a job.
    ///
    /// Success only means the scheduler accepted the request.
    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError>;
}
