//! Dispatching submissions to the scheduler.
//!
//! A request is either handed to the local scheduler client or run through a
//! session on a login gateway, depending on its [`TransportMode`]. The
//! transport never retries: a retried submission could run a job twice.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::error::CancelError;
use crate::error::MonitorError;
use crate::error::SubmissionError;
use crate::gateway::Gateway;
use crate::job::JobHandle;
use crate::request::SubmissionRequest;
use crate::scheduler::SchedulerClient;
use crate::scheduler::SchedulerError;
use crate::scheduler::SchedulerReport;
use crate::slurm::RemoteSlurm;
use crate::slurm::SlurmCommands;

/// How a job is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum TransportMode {
    /// Through the local scheduler client.
    Local,
    /// Through a login gateway.
    Remote {
        /// The gateway address.
        gateway: String,
    },
}

/// Submits, queries and cancels jobs in the mode they were submitted with.
#[derive(Debug, Clone)]
pub struct Transport {
    /// The local scheduler client.
    scheduler: Arc<dyn SchedulerClient>,
    /// The gateway used for remote submissions.
    gateway: Arc<dyn Gateway>,
    /// The Slurm commands run on login nodes.
    commands: SlurmCommands,
}

impl Transport {
    /// Creates a new transport.
    pub fn new(
        scheduler: Arc<dyn SchedulerClient>,
        gateway: Arc<dyn Gateway>,
        commands: SlurmCommands,
    ) -> Self {
        Self {
            scheduler,
            gateway,
            commands,
        }
    }

    /// Gets the scheduler client for a transport mode.
    fn client(&self, mode: &TransportMode) -> Arc<dyn SchedulerClient> {
        match mode {
            TransportMode::Local => self.scheduler.clone(),
            TransportMode::Remote { gateway } => Arc::new(RemoteSlurm::new(
                self.gateway.clone(),
                gateway,
                self.commands.clone(),
            )),
        }
    }

    /// Submits a request and returns the handle of the accepted job.
    ///
    /// The job directory must already hold the batch script. A submission
    /// whose outcome is unknown is reported as
    /// [`SubmissionError::Unconfirmed`].
    pub async fn submit(&self, request: &SubmissionRequest) -> Result<JobHandle, SubmissionError> {
        let mode = request.transport();
        debug!(job = request.job_name(), ?mode, "submitting job");

        let job_id = self
            .client(mode)
            .submit(request)
            .await
            .map_err(|e| match (e, mode) {
                (SchedulerError::Unconfirmed(message), _) => SubmissionError::Unconfirmed {
                    job: request.job_name().to_string(),
                    job_dir: request.job_dir().to_path_buf(),
                    message,
                },
                (e, TransportMode::Local) => SubmissionError::Local {
                    job: request.job_name().to_string(),
                    message: e.to_string(),
                },
                (e, TransportMode::Remote { gateway }) => SubmissionError::Remote {
                    job: request.job_name().to_string(),
                    gateway: gateway.clone(),
                    message: e.to_string(),
                },
            })?;

        info!(
            job = request.job_name(),
            %job_id,
            "job accepted by the scheduler"
        );
        Ok(JobHandle::new(
            job_id,
            request.job_name(),
            request.job_dir(),
            request.submitted_at(),
            mode.clone(),
        ))
    }

    /// Queries the scheduler for the status of a job.
    pub async fn status(&self, handle: &JobHandle) -> Result<SchedulerReport, MonitorError> {
        self.client(handle.mode())
            .status(handle.job_id())
            .await
            .map_err(|e| match e {
                SchedulerError::UnknownJob(_) => MonitorError::JobGone {
                    job_id: handle.job_id().to_string(),
                },
                e => MonitorError::Transient {
                    job_id: handle.job_id().to_string(),
                    message: e.to_string(),
                },
            })
    }

    /// Requests cancellation of a job.
    ///
    /// Success means the scheduler accepted the request, not that the job has
    /// stopped.
    pub async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError> {
        let mode = handle.mode();
        self.client(mode)
            .cancel(handle.job_id())
            .await
            .map_err(|e| match mode {
                TransportMode::Local => CancelError::Local {
                    job_id: handle.job_id().to_string(),
                    message: e.to_string(),
                },
                TransportMode::Remote { gateway } => CancelError::Remote {
                    job_id: handle.job_id().to_string(),
                    gateway: gateway.clone(),
                    message: e.to_string(),
                },
            })?;

        info!(job_id = handle.job_id(), "cancel request accepted");
        Ok(())
    }
}
