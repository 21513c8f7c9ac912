//! End-to-end tests of the executor against fake collaborators.

use std::collections::VecDeque;
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures::StreamExt as _;
use hpi_engine::CommandPayload;
use hpi_engine::ConfigError;
use hpi_engine::EngineConfig;
use hpi_engine::Executor;
use hpi_engine::JobHandle;
use hpi_engine::JobSpec;
use hpi_engine::JobStatus;
use hpi_engine::LogEvent;
use hpi_engine::LogStream;
use hpi_engine::Payload;
use hpi_engine::SubmissionError;
use hpi_engine::SubmissionRequest;
use hpi_engine::SubmitError;
use hpi_engine::TransportMode;
use hpi_engine::gateway::CommandOutput;
use hpi_engine::gateway::Gateway;
use hpi_engine::gateway::GatewayError;
use hpi_engine::gateway::GatewaySession;
use hpi_engine::scheduler::SchedulerClient;
use hpi_engine::scheduler::SchedulerError;
use hpi_engine::scheduler::SchedulerReport;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

/// A scheduler accepting every job and answering status queries from a
/// queue, repeating the last answer.
#[derive(Debug, Default)]
struct FakeScheduler {
    reject: Option<String>,
    statuses: Mutex<VecDeque<SchedulerReport>>,
    submitted: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

impl FakeScheduler {
    fn answering(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        Self {
            statuses: Mutex::new(
                statuses
                    .into_iter()
                    .map(|status| SchedulerReport {
                        status,
                        exit_code: status.is_terminal().then_some(0),
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SchedulerClient for FakeScheduler {
    async fn submit(&self, request: &SubmissionRequest) -> Result<String, SchedulerError> {
        if let Some(message) = &self.reject {
            return Err(SchedulerError::Rejected(message.clone()));
        }

        assert!(
            request.script_path().is_file(),
            "the batch script is written before submission"
        );
        let mut submitted = self.submitted.lock();
        submitted.push(request.job_name().to_string());
        Ok((1000 + submitted.len()).to_string())
    }

    async fn status(&self, job_id: &str) -> Result<SchedulerReport, SchedulerError> {
        let mut statuses = self.statuses.lock();
        let report = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        report.ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.cancelled.lock().push(job_id.to_string());
        Ok(())
    }
}

/// A gateway whose login node cannot be reached.
#[derive(Debug)]
struct Unreachable;

#[async_trait]
impl Gateway for Unreachable {
    async fn connect(&self, address: &str) -> Result<Box<dyn GatewaySession>, GatewayError> {
        Err(GatewayError::Connect {
            address: address.to_string(),
            message: "connection refused".to_string(),
        })
    }
}

/// A gateway whose connection drops once a command has been sent.
#[derive(Debug, Default)]
struct Dropping {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

struct DroppingSession {
    address: String,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Gateway for Dropping {
    async fn connect(&self, address: &str) -> Result<Box<dyn GatewaySession>, GatewayError> {
        Ok(Box::new(DroppingSession {
            address: address.to_string(),
            sent: self.sent.clone(),
            closed: self.closed.clone(),
        }))
    }
}

#[async_trait]
impl GatewaySession for DroppingSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput, GatewayError> {
        self.sent.lock().push(command.to_string());
        Err(GatewayError::Exec {
            address: self.address.clone(),
            message: "connection reset by peer".to_string(),
        })
    }

    async fn close(self: Box<Self>) -> Result<(), GatewayError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn executor(scheduler: Arc<FakeScheduler>) -> Executor {
    executor_with(scheduler, Arc::new(Unreachable))
}

fn executor_with(scheduler: Arc<FakeScheduler>, gateway: Arc<dyn Gateway>) -> Executor {
    let config = EngineConfig {
        poll_interval_ms: 1,
        ..Default::default()
    };
    Executor::with_collaborators(config, scheduler, gateway).unwrap()
}

fn spec(log_dir: &Path) -> JobSpec {
    let mut spec = JobSpec::new("test-job", "gpu", "01:00:00");
    spec.gpus_per_node = 2;
    spec.log_dir = log_dir.to_path_buf();
    spec
}

fn entries(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn submit_monitor_and_cancel_a_local_job() {
    let logs = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::answering([
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
    ]));
    let executor = executor(scheduler.clone());

    let handle = executor
        .submit_cli_job(spec(logs.path()), ["echo", "hello"])
        .await
        .unwrap();
    assert_eq!(handle.job_id(), "1001");
    assert_eq!(handle.mode(), &TransportMode::Local);
    assert_eq!(handle.job_dir().parent(), Some(logs.path()));
    assert!(
        handle
            .job_dir()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("test-job-")
    );

    let script = std::fs::read_to_string(handle.job_dir().join("job.sh")).unwrap();
    assert!(script.contains("#SBATCH --gpus-per-node=2"));
    assert!(script.contains(&format!(
        "#SBATCH --output={}",
        handle.stdout().display()
    )));
    assert!(handle.job_dir().join("request.json").is_file());

    // The stored handle reattaches to the same job.
    assert_eq!(JobHandle::load(handle.job_dir()).unwrap(), handle);

    assert_eq!(executor.status(&handle).await.unwrap(), JobStatus::Pending);
    executor.cancel(&handle).await.unwrap();
    assert_eq!(scheduler.cancelled.lock().as_slice(), ["1001"]);

    std::fs::write(handle.stdout(), "hello\n").unwrap();
    std::fs::write(handle.stderr(), "warning: slow\n").unwrap();
    let mut stream = pin!(executor.stream(&handle));
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.unwrap());
    }

    assert_eq!(
        events,
        [
            LogEvent::Line {
                stream: LogStream::Stdout,
                line: "hello".to_string()
            },
            LogEvent::Line {
                stream: LogStream::Stderr,
                line: "warning: slow".to_string()
            },
            LogEvent::Finished(executor.wait(&handle).await.unwrap()),
        ]
    );
    assert_eq!(
        executor.wait(&handle).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn unreachable_gateway_leaves_nothing_behind() {
    let logs = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::default());
    let executor = executor(scheduler.clone());

    let mut spec = spec(logs.path());
    spec.login_node = Some("login.example.org".to_string());
    let err = executor
        .submit(spec, Payload::Command(CommandPayload::new(["true"])))
        .await
        .unwrap_err();

    assert!(
        matches!(
            &err,
            SubmitError::Submission(SubmissionError::Remote { job, gateway, message })
                if job == "test-job"
                    && gateway == "login.example.org"
                    && message.contains("connection refused")
        ),
        "unexpected error: {err}"
    );
    assert_eq!(entries(logs.path()), 0);
    assert!(scheduler.submitted.lock().is_empty());
}

#[tokio::test]
async fn dropped_connection_keeps_the_job_directory() {
    let logs = tempfile::tempdir().unwrap();
    let gateway = Arc::new(Dropping::default());
    let executor = executor_with(Arc::new(FakeScheduler::default()), gateway.clone());

    let mut spec = spec(logs.path());
    spec.login_node = Some("login.example.org".to_string());
    let err = executor
        .submit_cli_job(spec, ["true"])
        .await
        .unwrap_err();

    let SubmitError::Submission(SubmissionError::Unconfirmed { job_dir, .. }) = &err else {
        panic!("unexpected error: {err}");
    };
    // The job may be queued, so its script and log location must survive.
    assert!(job_dir.join("job.sh").is_file());
    assert!(job_dir.join("request.json").is_file());
    assert_eq!(entries(logs.path()), 1);
    assert!(err.to_string().contains("squeue"));

    assert_eq!(gateway.sent.lock().len(), 1);
    assert!(gateway.sent.lock()[0].starts_with("sbatch --parsable "));
    assert_eq!(gateway.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_job_removes_its_directory() {
    let logs = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler {
        reject: Some("invalid partition specified: gpu".to_string()),
        ..Default::default()
    });
    let executor = executor(scheduler);

    let err = executor
        .submit_cli_job(spec(logs.path()), ["true"])
        .await
        .unwrap_err();
    assert!(
        matches!(
            &err,
            SubmitError::Submission(SubmissionError::Local { message, .. })
                if message.contains("invalid partition")
        ),
        "unexpected error: {err}"
    );
    assert_eq!(entries(logs.path()), 0);
}

#[tokio::test]
async fn invalid_spec_never_reaches_the_scheduler() {
    let logs = tempfile::tempdir().unwrap();
    let log_dir = logs.path().join("nested");
    let scheduler = Arc::new(FakeScheduler::default());
    let executor = executor(scheduler.clone());

    let mut spec = spec(&log_dir);
    spec.num_nodes = 4;
    let err = executor
        .submit_cli_job(spec, ["true"])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SubmitError::Config(ConfigError::MissingSharedStorageRoot { nodes: 4, .. })
    ));
    assert!(!log_dir.exists());
    assert!(scheduler.submitted.lock().is_empty());
}

#[tokio::test]
async fn concurrent_submissions_get_distinct_directories() {
    let logs = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::default());
    let executor = executor(scheduler);

    let (first, second) = tokio::join!(
        executor.submit_cli_job(spec(logs.path()), ["true"]),
        executor.submit_cli_job(spec(logs.path()), ["true"]),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.job_dir(), second.job_dir());
    assert_ne!(first.job_id(), second.job_id());
}
