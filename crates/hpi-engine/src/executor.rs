//! The submission façade.
//!
//! The [`Executor`] is the only component that knows about all the others. A
//! submission flows through it in one direction: the job specification is
//! validated, a distributed plan is drawn, the request is built, the job
//! directory is prepared and the request is handed to the transport.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::Result;
use chrono::Utc;
use futures::Stream;
use indexmap::IndexMap;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::CancelError;
use crate::error::MonitorError;
use crate::error::SubmissionError;
use crate::error::SubmitError;
use crate::gateway::Gateway;
use crate::gateway::SshGateway;
use crate::job::JobHandle;
use crate::job::JobStatus;
use crate::job::JobSummary;
use crate::job::LogEvent;
use crate::monitor::JobMonitor;
use crate::plan::Planner;
use crate::request::CommandPayload;
use crate::request::DistributedPayload;
use crate::request::FunctionPayload;
use crate::request::Payload;
use crate::request::REQUEST_FILE_NAME;
use crate::request::RequestBuilder;
use crate::request::SubmissionRequest;
use crate::scheduler::SchedulerClient;
use crate::script;
use crate::slurm::SlurmCli;
use crate::slurm::SlurmCommands;
use crate::spec::JobSpec;
use crate::spec::ValidJobSpec;
use crate::tracking::Tracker;
use crate::transport::Transport;

/// How many timestamps are tried before giving up on creating a job
/// directory.
const MAX_JOB_DIR_ATTEMPTS: u32 = 10;

/// Submits and supervises jobs.
#[derive(Debug)]
pub struct Executor {
    /// The engine configuration.
    config: EngineConfig,
    /// The distributed planner.
    planner: Planner,
    /// The transport.
    transport: Transport,
    /// The job monitor.
    monitor: JobMonitor,
}

impl Executor {
    /// Creates an executor submitting through the Slurm command line tools,
    /// locally or over SSH.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let scheduler = Arc::new(SlurmCli::new(SlurmCommands::new(
            config.slurm_bin_dir.clone(),
        )));
        let gateway = Arc::new(SshGateway::new(config.ssh.clone()));
        Self::with_collaborators(config, scheduler, gateway)
    }

    /// Creates an executor using the given scheduler client and gateway.
    pub fn with_collaborators(
        config: EngineConfig,
        scheduler: Arc<dyn SchedulerClient>,
        gateway: Arc<dyn Gateway>,
    ) -> Result<Self> {
        config
            .validate()
            .context("invalid engine configuration")?;

        let transport = Transport::new(
            scheduler,
            gateway,
            SlurmCommands::new(config.slurm_bin_dir.clone()),
        );
        Ok(Self {
            planner: Planner::new(config.port_range),
            monitor: JobMonitor::new(transport.clone(), &config),
            transport,
            config,
        })
    }

    /// Registers a tracker notified of every job status change.
    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.monitor.add_tracker(tracker);
        self
    }

    /// Gets the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Gets the job monitor.
    pub fn monitor(&self) -> &JobMonitor {
        &self.monitor
    }

    /// Submits a script run by an interpreter.
    pub async fn submit_function(
        &self,
        spec: JobSpec,
        function: FunctionPayload,
    ) -> Result<JobHandle, SubmitError> {
        self.submit(spec, Payload::Function(function)).await
    }

    /// Submits a distributed training payload.
    pub async fn submit_distributed(
        &self,
        spec: JobSpec,
        payload: DistributedPayload,
    ) -> Result<JobHandle, SubmitError> {
        self.submit(spec, Payload::Distributed(payload)).await
    }

    /// Submits an arbitrary command line.
    pub async fn submit_cli_job<I, S>(&self, spec: JobSpec, argv: I) -> Result<JobHandle, SubmitError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(spec, Payload::Command(CommandPayload::new(argv)))
            .await
    }

    /// Submits a LLaMA-Factory training run with the given training
    /// configuration.
    pub async fn submit_llamafactory(
        &self,
        spec: JobSpec,
        config_path: impl Into<PathBuf>,
    ) -> Result<JobHandle, SubmitError> {
        self.submit_distributed(spec, DistributedPayload::llamafactory(config_path))
            .await
    }

    /// Submits a job.
    ///
    /// Nothing reaches the scheduler if the specification is invalid or the
    /// job directory cannot be prepared. If preparing the directory fails or
    /// the scheduler turns the job down, the job directory is removed again.
    /// It is kept when the scheduler may have accepted the job without
    /// reporting an id.
    pub async fn submit(&self, spec: JobSpec, payload: Payload) -> Result<JobHandle, SubmitError> {
        let spec = ValidJobSpec::new(spec)?;
        payload.validate(&spec.job_name)?;

        let log_dir = std::path::absolute(&spec.log_dir).map_err(|e| SubmissionError::Prepare {
            job: spec.job_name.clone(),
            path: spec.log_dir.clone(),
            source: e.into(),
        })?;
        let spec = ValidJobSpec::new(JobSpec {
            log_dir,
            ..spec.into_inner()
        })?;

        let plan = self.planner.plan(&spec, &mut rand::rng());
        let builder = RequestBuilder::new(&self.config).with_base_env(self.base_env());

        let mut attempts = 1;
        let request = loop {
            let request = builder.build(&spec, &plan, &payload, Utc::now());
            match create_job_dir(request.job_dir()).await {
                Ok(()) => break request,
                Err(e)
                    if e.kind() == io::ErrorKind::AlreadyExists
                        && attempts < MAX_JOB_DIR_ATTEMPTS =>
                {
                    debug!(
                        path = %request.job_dir().display(),
                        "job directory already exists; drawing a new timestamp"
                    );
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => {
                    return Err(SubmissionError::Prepare {
                        job: request.job_name().to_string(),
                        path: request.job_dir().to_path_buf(),
                        source: anyhow::Error::new(e).context("failed to create job directory"),
                    }
                    .into());
                }
            }
        };
        debug!(
            job = request.job_name(),
            port = plan.rendezvous_port(),
            world_size = plan.world_size(),
            path = %request.job_dir().display(),
            "built submission request"
        );

        if let Err(e) = write_job_files(&request).await {
            remove_job_dir(request.job_dir()).await;
            return Err(SubmissionError::Prepare {
                job: request.job_name().to_string(),
                path: request.job_dir().to_path_buf(),
                source: e,
            }
            .into());
        }

        let handle = match self.transport.submit(&request).await {
            Ok(handle) => handle,
            Err(e) if e.is_unconfirmed() => {
                warn!(
                    job = request.job_name(),
                    path = %request.job_dir().display(),
                    "submission outcome unknown; keeping the job directory"
                );
                return Err(e.into());
            }
            Err(e) => {
                remove_job_dir(request.job_dir()).await;
                return Err(e.into());
            }
        };

        if let Err(e) = handle.save() {
            warn!(job_id = handle.job_id(), "{e:#}");
        }

        info!(
            job = handle.job_name(),
            job_id = handle.job_id(),
            stdout = %handle.stdout().display(),
            stderr = %handle.stderr().display(),
            "submitted job"
        );
        Ok(handle)
    }

    /// Queries the status of a job.
    pub async fn status(&self, handle: &JobHandle) -> Result<JobStatus, MonitorError> {
        self.monitor.poll(handle).await
    }

    /// Requests cancellation of a job through the transport it was
    /// submitted with.
    pub async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError> {
        self.transport.cancel(handle).await
    }

    /// Streams the output of a job until it reaches a terminal status.
    pub fn stream<'a>(
        &'a self,
        handle: &'a JobHandle,
    ) -> impl Stream<Item = Result<LogEvent, MonitorError>> + Send + 'a {
        self.monitor.stream_logs(handle)
    }

    /// Waits until a job reaches a terminal status.
    pub async fn wait(&self, handle: &JobHandle) -> Result<JobSummary, MonitorError> {
        self.monitor.wait(handle).await
    }

    /// Gets the base environment inherited from this process.
    fn base_env(&self) -> IndexMap<String, String> {
        self.config
            .inherit_env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect()
    }
}

/// Creates a job directory.
///
/// The log directory is created as needed, but the job directory itself is
/// created non-recursively so an existing directory is never reused.
async fn create_job_dir(dir: &Path) -> io::Result<()> {
    if let Some(parent) = dir.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::create_dir(dir).await
}

/// Removes a job directory that holds no submitted job.
async fn remove_job_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(path = %dir.display(), "failed to remove job directory: {e}");
    }
}

/// Writes the batch script and the request into the job directory.
async fn write_job_files(request: &SubmissionRequest) -> Result<()> {
    let script_path = request.script_path();
    let script = script::render(request).context("failed to render batch script")?;
    tokio::fs::write(&script_path, script)
        .await
        .with_context(|| {
            format!(
                "failed to write batch script `{path}`",
                path = script_path.display()
            )
        })?;
    #[cfg(unix)]
    tokio::fs::set_permissions(
        &script_path,
        <std::fs::Permissions as std::os::unix::fs::PermissionsExt>::from_mode(0o770),
    )
    .await?;

    let request_path = request.job_dir().join(REQUEST_FILE_NAME);
    let contents = serde_json::to_string_pretty(request)?;
    tokio::fs::write(&request_path, contents)
        .await
        .with_context(|| {
            format!(
                "failed to write request `{path}`",
                path = request_path.display()
            )
        })?;
    Ok(())
}
