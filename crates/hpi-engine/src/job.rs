//! Submitted jobs and their lifecycle.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::request::STDERR_FILE_NAME;
use crate::request::STDOUT_FILE_NAME;
use crate::transport::TransportMode;

/// The name of the file in the job directory holding the job handle.
pub const HANDLE_FILE_NAME: &str = "handle.json";

/// The lifecycle status of a job.
///
/// Statuses are ordered by lifecycle stage; the terminal statuses share the
/// last stage and are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// The job is queued.
    Pending,
    /// The job is running.
    Running,
    /// The job finished successfully.
    Completed,
    /// The job failed.
    Failed,
    /// The job was cancelled.
    Cancelled,
    /// The job hit its wall-time limit.
    Timeout,
}

impl JobStatus {
    /// Gets the lifecycle stage of the status.
    pub fn stage(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout => 2,
        }
    }

    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        self.stage() == 2
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// A job accepted by the scheduler.
///
/// The handle is written to the job directory after acceptance so later
/// invocations can reattach to the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// The scheduler-assigned job id.
    job_id: String,
    /// The job name.
    job_name: String,
    /// The job directory.
    job_dir: PathBuf,
    /// When the job was submitted.
    created_at: DateTime<Utc>,
    /// How the job was submitted.
    mode: TransportMode,
}

impl JobHandle {
    /// Creates a new job handle.
    pub fn new(
        job_id: impl Into<String>,
        job_name: impl Into<String>,
        job_dir: impl Into<PathBuf>,
        created_at: DateTime<Utc>,
        mode: TransportMode,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            job_dir: job_dir.into(),
            created_at,
            mode,
        }
    }

    /// Loads the handle stored in a job directory.
    pub fn load(job_dir: &Path) -> Result<Self> {
        let path = job_dir.join(HANDLE_FILE_NAME);
        let contents = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "failed to read job handle `{path}`",
                path = path.display()
            )
        })?;
        serde_json::from_str(&contents).with_context(|| {
            format!(
                "failed to parse job handle `{path}`",
                path = path.display()
            )
        })
    }

    /// Stores the handle in its job directory.
    pub fn save(&self) -> Result<()> {
        let path = self.job_dir.join(HANDLE_FILE_NAME);
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, contents).with_context(|| {
            format!(
                "failed to write job handle `{path}`",
                path = path.display()
            )
        })
    }

    /// Gets the job id.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Gets the job name.
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Gets the job directory.
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// Gets the path of the job's standard output file.
    pub fn stdout(&self) -> PathBuf {
        self.job_dir.join(STDOUT_FILE_NAME)
    }

    /// Gets the path of the job's standard error file.
    pub fn stderr(&self) -> PathBuf {
        self.job_dir.join(STDERR_FILE_NAME)
    }

    /// Gets when the job was submitted.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Gets how the job was submitted.
    pub fn mode(&self) -> &TransportMode {
        &self.mode
    }
}

/// The final result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// The job id.
    pub job_id: String,
    /// The job name.
    pub job_name: String,
    /// The terminal status.
    pub status: JobStatus,
    /// The exit code, if the scheduler reported one.
    pub exit_code: Option<i32>,
    /// The job directory.
    pub job_dir: PathBuf,
    /// The path of the standard output file.
    pub stdout: PathBuf,
    /// The path of the standard error file.
    pub stderr: PathBuf,
}

impl JobSummary {
    /// Creates the summary of a job.
    pub fn new(handle: &JobHandle, status: JobStatus, exit_code: Option<i32>) -> Self {
        Self {
            job_id: handle.job_id.clone(),
            job_name: handle.job_name.clone(),
            status,
            exit_code,
            job_dir: handle.job_dir.clone(),
            stdout: handle.stdout(),
            stderr: handle.stderr(),
        }
    }
}

/// The output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    /// The standard output file.
    Stdout,
    /// The standard error file.
    Stderr,
}

/// An item of a job's log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A line of output, without its line terminator.
    Line {
        /// The stream the line came from.
        stream: LogStream,
        /// The line.
        line: String,
    },
    /// The job reached a terminal status; this is the last item.
    Finished(JobSummary),
}
