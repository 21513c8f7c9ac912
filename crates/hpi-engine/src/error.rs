//! Error types surfaced by the engine.

use std::path::PathBuf;

use thiserror::Error;

/// A job specification failed validation.
///
/// A job that fails validation never reaches the scheduler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The node count is zero.
    #[error("job `{job}`: `num_nodes` must be at least 1")]
    InvalidNodeCount {
        /// The job name.
        job: String,
    },
    /// The processes-per-node count is zero.
    #[error("job `{job}`: `processes_per_node` must be at least 1")]
    InvalidProcessCount {
        /// The job name.
        job: String,
    },
    /// The wall-time did not parse to a positive duration.
    #[error("job `{job}`: `walltime` value `{value}` is invalid: {reason}")]
    InvalidWalltime {
        /// The job name.
        job: String,
        /// The offending value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// The partition is empty.
    #[error("job `{job}`: `partition` cannot be empty")]
    EmptyPartition {
        /// The job name.
        job: String,
    },
    /// A container mount is not a single `host:container` pair.
    #[error(
        "job `{job}`: container mount `{mount}` must be a single `host:container` pair of \
         non-empty paths"
    )]
    InvalidMount {
        /// The job name.
        job: String,
        /// The offending mount string.
        mount: String,
    },
    /// A multi-node job did not set a shared storage root.
    #[error(
        "job `{job}`: `shared_storage_root` must be set when requesting {nodes} nodes; \
         distributed training needs a path visible from every node"
    )]
    MissingSharedStorageRoot {
        /// The job name.
        job: String,
        /// The requested node count.
        nodes: u32,
    },
    /// The job name cannot be used in a directory or job name.
    #[error("job name `{job}` must be non-empty and contain no whitespace or `/`")]
    InvalidJobName {
        /// The job name.
        job: String,
    },
    /// An extra environment variable name is not a shell identifier.
    #[error("job `{job}`: environment variable name `{key}` is not a valid identifier")]
    InvalidEnvVar {
        /// The job name.
        job: String,
        /// The offending name.
        key: String,
    },
    /// The payload has no program or script to run.
    #[error("job `{job}`: the payload has nothing to run")]
    EmptyPayload {
        /// The job name.
        job: String,
    },
}

/// The scheduler or the gateway rejected or failed a submission.
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// The job directory could not be prepared; the scheduler was not
    /// contacted.
    #[error("job `{job}`: failed to prepare job directory `{dir}`", dir = .path.display())]
    Prepare {
        /// The job name.
        job: String,
        /// The job directory.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
    /// The local scheduler client rejected the job.
    #[error("job `{job}`: scheduler rejected the submission: {message}")]
    Local {
        /// The job name.
        job: String,
        /// The scheduler's message.
        message: String,
    },
    /// Submission through the login gateway failed.
    #[error("job `{job}`: remote submission through `{gateway}` failed: {message}")]
    Remote {
        /// The job name.
        job: String,
        /// The gateway address.
        gateway: String,
        /// What went wrong.
        message: String,
    },
    /// The submission may have been accepted, but no job id came back.
    ///
    /// The job directory is kept: a queued job still writes its logs there.
    #[error(
        "job `{job}`: submission outcome unknown ({message}); job directory `{dir}` was kept, \
         check `squeue` before submitting again",
        dir = .job_dir.display()
    )]
    Unconfirmed {
        /// The job name.
        job: String,
        /// The job directory.
        job_dir: PathBuf,
        /// What went wrong.
        message: String,
    },
}

impl SubmissionError {
    /// Whether the job may have reached the scheduler.
    pub fn is_unconfirmed(&self) -> bool {
        matches!(self, Self::Unconfirmed { .. })
    }
}

/// An error from the executor's submission entry points.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The job specification is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The submission failed.
    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

/// Monitoring a job failed.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// A status query or log read failed in a way that may succeed on retry.
    #[error("job `{job_id}`: {message}")]
    Transient {
        /// The job id.
        job_id: String,
        /// What went wrong.
        message: String,
    },
    /// The scheduler does not know the job.
    #[error("job `{job_id}` is unknown to the scheduler")]
    JobGone {
        /// The job id.
        job_id: String,
    },
    /// Too many consecutive transient failures.
    #[error("job `{job_id}`: giving up after {attempts} consecutive failures: {last}")]
    Exhausted {
        /// The job id.
        job_id: String,
        /// The number of consecutive failures.
        attempts: u32,
        /// The message of the last failure.
        last: String,
    },
}

impl MonitorError {
    /// Whether the error may go away on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// A cancel request was not delivered or not acknowledged.
#[derive(Debug, Error)]
pub enum CancelError {
    /// The local scheduler client failed to cancel the job.
    #[error("job `{job_id}`: cancel request failed: {message}")]
    Local {
        /// The job id.
        job_id: String,
        /// What went wrong.
        message: String,
    },
    /// Cancelling through the login gateway failed.
    #[error("job `{job_id}`: cancel request through `{gateway}` failed: {message}")]
    Remote {
        /// The job id.
        job_id: String,
        /// The gateway address.
        gateway: String,
        /// What went wrong.
        message: String,
    },
}
