//! Implementation of the Slurm scheduler client.
//!
//! Slurm is driven through its command line tools: `sbatch` to submit,
//! `squeue` (falling back to `sacct` once a job has left the queue) to query
//! and `scancel` to cancel. The same commands are run either as local
//! processes or through a gateway session on a login node.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::gateway::CommandOutput;
use crate::gateway::Gateway;
use crate::gateway::GatewaySession;
use crate::gateway::RunError;
use crate::gateway::run;
use crate::job::JobStatus;
use crate::request::SubmissionRequest;
use crate::scheduler::SchedulerClient;
use crate::scheduler::SchedulerError;
use crate::scheduler::SchedulerReport;

/// How long a local Slurm command may take.
const LOCAL_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// The prefix of the line `sbatch` prints without `--parsable`.
const SUBMITTED_PREFIX: &str = "Submitted batch job ";

/// Runs Slurm command lines somewhere.
#[async_trait]
pub trait CommandRunner: Send {
    /// Runs the command line given as argv.
    async fn run(&mut self, argv: &[String]) -> Result<CommandOutput, SchedulerError>;
}

/// Runs commands as local processes.
#[derive(Debug, Clone, Copy)]
pub struct LocalRunner {
    /// How long a command may take.
    timeout: Duration,
}

impl LocalRunner {
    /// Creates a new local runner.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&mut self, argv: &[String]) -> Result<CommandOutput, SchedulerError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SchedulerError::Unavailable("empty command line".to_string()))?;

        let mut command = Command::new(program);
        command.args(args);
        debug!(?command, "spawning Slurm command");

        run(command, self.timeout).await.map_err(|e| match e {
            RunError::Spawn(message) => SchedulerError::Unavailable(message),
            // The command may have done its work before it was stopped.
            RunError::Timeout => SchedulerError::Unconfirmed(format!(
                "`{program}` did not finish within {secs} seconds",
                secs = self.timeout.as_secs()
            )),
        })
    }
}

/// Runs commands through an open gateway session.
pub struct SessionRunner<'a> {
    /// The session.
    session: &'a mut dyn GatewaySession,
}

impl<'a> SessionRunner<'a> {
    /// Creates a runner over the given session.
    pub fn new(session: &'a mut dyn GatewaySession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl CommandRunner for SessionRunner<'_> {
    async fn run(&mut self, argv: &[String]) -> Result<CommandOutput, SchedulerError> {
        let line = shlex::try_join(argv.iter().map(String::as_str))
            .map_err(|e| SchedulerError::Unavailable(format!("cannot quote command line: {e}")))?;
        // The session was open, so the command may have run on the remote
        // side even if its output was lost.
        self.session
            .exec(&line)
            .await
            .map_err(|e| SchedulerError::Unconfirmed(e.to_string()))
    }
}

/// Renders Slurm command lines and interprets their output.
#[derive(Debug, Clone, Default)]
pub struct SlurmCommands {
    /// The directory holding the Slurm binaries, if not on `PATH`.
    bin_dir: Option<PathBuf>,
}

impl SlurmCommands {
    /// Creates commands using binaries from the given directory, or from
    /// `PATH` if `None`.
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    /// Gets the program path of a Slurm tool.
    fn program(&self, name: &str) -> String {
        match &self.bin_dir {
            Some(dir) => dir.join(name).display().to_string(),
            None => name.to_string(),
        }
    }

    /// Renders the `sbatch` command line submitting a script.
    pub fn sbatch(&self, script: &Path) -> Vec<String> {
        vec![
            self.program("sbatch"),
            "--parsable".to_string(),
            script.display().to_string(),
        ]
    }

    /// Renders the `squeue` command line querying a job.
    pub fn squeue(&self, job_id: &str) -> Vec<String> {
        vec![
            self.program("squeue"),
            "-h".to_string(),
            "-j".to_string(),
            job_id.to_string(),
            "-o".to_string(),
            "%T".to_string(),
        ]
    }

    /// Renders the `sacct` command line querying a finished job.
    pub fn sacct(&self, job_id: &str) -> Vec<String> {
        vec![
            self.program("sacct"),
            "-j".to_string(),
            job_id.to_string(),
            "-X".to_string(),
            "-n".to_string(),
            "-P".to_string(),
            "-o".to_string(),
            "State,ExitCode".to_string(),
        ]
    }

    /// Renders the `scancel` command line cancelling a job.
    pub fn scancel(&self, job_id: &str) -> Vec<String> {
        vec![self.program("scancel"), job_id.to_string()]
    }

    /// Submits a batch script and returns the job id.
    pub async fn submit(
        &self,
        runner: &mut dyn CommandRunner,
        script: &Path,
    ) -> Result<String, SchedulerError> {
        let output = runner.run(&self.sbatch(script)).await?;
        trace!(stdout = %output.stdout, stderr = %output.stderr, "`sbatch` finished");
        if !output.success() {
            return Err(SchedulerError::Rejected(output.failure_message()));
        }

        parse_job_id(&output.stdout).ok_or_else(|| {
            SchedulerError::Unconfirmed(format!(
                "`sbatch` printed no job id: `{stdout}`",
                stdout = output.stdout.trim()
            ))
        })
    }

    /// Queries the status of a job.
    pub async fn status(
        &self,
        runner: &mut dyn CommandRunner,
        job_id: &str,
    ) -> Result<SchedulerReport, SchedulerError> {
        let queued = runner.run(&self.squeue(job_id)).await?;
        trace!(stdout = %queued.stdout, stderr = %queued.stderr, "`squeue` finished");
        if queued.success()
            && let Some(state) = first_line(&queued.stdout)
        {
            return parse_state(state)
                .map(SchedulerReport::new)
                .ok_or_else(|| unrecognized(state));
        }

        // The job has left the queue (or `squeue` does not know it); ask the
        // accounting database.
        let accounted = runner.run(&self.sacct(job_id)).await?;
        trace!(stdout = %accounted.stdout, stderr = %accounted.stderr, "`sacct` finished");
        if !accounted.success() {
            let message = if queued.success() {
                accounted.failure_message()
            } else {
                format!(
                    "{squeue}; {sacct}",
                    squeue = queued.failure_message(),
                    sacct = accounted.failure_message()
                )
            };
            return Err(SchedulerError::Unavailable(message));
        }

        match first_line(&accounted.stdout) {
            Some(line) => parse_accounting(line).ok_or_else(|| unrecognized(line)),
            None => Err(SchedulerError::UnknownJob(job_id.to_string())),
        }
    }

    /// Requests cancellation of a job.
    pub async fn cancel(
        &self,
        runner: &mut dyn CommandRunner,
        job_id: &str,
    ) -> Result<(), SchedulerError> {
        let output = runner.run(&self.scancel(job_id)).await?;
        if output.success() {
            return Ok(());
        }

        let message = output.failure_message();
        if message.contains("Invalid job id") {
            return Err(SchedulerError::UnknownJob(job_id.to_string()));
        }
        Err(SchedulerError::Rejected(message))
    }
}

/// Gets the first non-empty line of command output.
fn first_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|l| !l.is_empty())
}

/// Creates the error for output that could not be interpreted.
fn unrecognized(output: &str) -> SchedulerError {
    SchedulerError::Unavailable(format!("unrecognized Slurm job state `{output}`"))
}

/// Parses the job id printed by `sbatch`.
///
/// Accepts `<id>` and `<id>;<cluster>` as printed with `--parsable`, and the
/// `Submitted batch job <id>` line printed without it. Login shells may print
/// banners around the output, so the last line in either form wins.
pub fn parse_job_id(stdout: &str) -> Option<String> {
    stdout.lines().rev().find_map(|line| {
        let line = line.trim();
        let id = line.strip_prefix(SUBMITTED_PREFIX).unwrap_or(line);
        let id = id.split(';').next()?.trim();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '_') {
            return None;
        }
        Some(id.to_string())
    })
}

/// Maps a Slurm job state name to a job status.
pub fn parse_state(state: &str) -> Option<JobStatus> {
    // `sacct` reports cancellations as `CANCELLED by <uid>` and may append a
    // `+` to truncated names.
    let name = state
        .split_whitespace()
        .next()?
        .trim_end_matches('+');
    let status = match name {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESIZING"
        | "SUSPENDED" => JobStatus::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" => JobStatus::Running,
        "COMPLETED" => JobStatus::Completed,
        "CANCELLED" => JobStatus::Cancelled,
        "TIMEOUT" | "DEADLINE" => JobStatus::Timeout,
        "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "PREEMPTED" => {
            JobStatus::Failed
        }
        _ => return None,
    };
    Some(status)
}

/// Parses a `State|ExitCode` line printed by `sacct -P`.
fn parse_accounting(line: &str) -> Option<SchedulerReport> {
    let mut fields = line.split('|');
    let status = parse_state(fields.next()?)?;
    let exit_code = fields
        .next()
        .and_then(|code| code.split(':').next())
        .and_then(|code| code.trim().parse().ok());
    Some(SchedulerReport { status, exit_code })
}

/// A scheduler client running the Slurm tools locally.
#[derive(Debug, Clone)]
pub struct SlurmCli {
    /// The command renderer.
    commands: SlurmCommands,
}

impl SlurmCli {
    /// Creates a new Slurm client.
    pub fn new(commands: SlurmCommands) -> Self {
        Self { commands }
    }

    /// Creates a runner for one operation.
    fn runner(&self) -> LocalRunner {
        LocalRunner::new(LOCAL_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl SchedulerClient for SlurmCli {
    async fn submit(&self, request: &SubmissionRequest) -> Result<String, SchedulerError> {
        self.commands
            .submit(&mut self.runner(), &request.script_path())
            .await
    }

    async fn status(&self, job_id: &str) -> Result<SchedulerReport, SchedulerError> {
        self.commands.status(&mut self.runner(), job_id).await
    }

    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.commands.cancel(&mut self.runner(), job_id).await
    }
}

/// A scheduler client running the Slurm tools on a login node.
///
/// Every operation opens its own gateway session and closes it before
/// returning, on success and on failure.
#[derive(Debug, Clone)]
pub struct RemoteSlurm {
    /// The gateway.
    gateway: Arc<dyn Gateway>,
    /// The login node address.
    address: String,
    /// The command renderer.
    commands: SlurmCommands,
}

impl RemoteSlurm {
    /// Creates a client for the given login node.
    pub fn new(gateway: Arc<dyn Gateway>, address: impl Into<String>, commands: SlurmCommands) -> Self {
        Self {
            gateway,
            address: address.into(),
            commands,
        }
    }

    /// Opens a session to the login node.
    async fn connect(&self) -> Result<Box<dyn GatewaySession>, SchedulerError> {
        self.gateway
            .connect(&self.address)
            .await
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))
    }
}

/// Closes a session, then returns the result of the work done through it.
///
/// A failure to close does not override a successful result: a job accepted
/// by the scheduler must still be reported.
async fn finish<T>(
    session: Box<dyn GatewaySession>,
    result: Result<T, SchedulerError>,
) -> Result<T, SchedulerError> {
    let address = session.address().to_string();
    if let Err(e) = session.close().await {
        warn!(%address, "failed to close gateway session: {e}");
    }
    result
}

#[async_trait]
impl SchedulerClient for RemoteSlurm {
    async fn submit(&self, request: &SubmissionRequest) -> Result<String, SchedulerError> {
        let mut session = self.connect().await?;
        let result = self
            .commands
            .submit(
                &mut SessionRunner::new(session.as_mut()),
                &request.script_path(),
            )
            .await;
        finish(session, result).await
    }

    async fn status(&self, job_id: &str) -> Result<SchedulerReport, SchedulerError> {
        let mut session = self.connect().await?;
        let result = self
            .commands
            .status(&mut SessionRunner::new(session.as_mut()), job_id)
            .await;
        finish(session, result).await
    }

    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        let mut session = self.connect().await?;
        let result = self
            .commands
            .cancel(&mut SessionRunner::new(session.as_mut()), job_id)
            .await;
        finish(session, result).await
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Replays canned outputs and records the command lines it was given.
    #[derive(Default)]
    struct Replay {
        outputs: VecDeque<CommandOutput>,
        seen: Vec<Vec<String>>,
    }

    impl Replay {
        fn new(outputs: impl IntoIterator<Item = (i32, &'static str, &'static str)>) -> Self {
            Self {
                outputs: outputs
                    .into_iter()
                    .map(|(status, stdout, stderr)| CommandOutput {
                        status: Some(status),
                        stdout: stdout.to_string(),
                        stderr: stderr.to_string(),
                    })
                    .collect(),
                seen: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for Replay {
        async fn run(&mut self, argv: &[String]) -> Result<CommandOutput, SchedulerError> {
            self.seen.push(argv.to_vec());
            self.outputs
                .pop_front()
                .ok_or_else(|| SchedulerError::Unavailable("no more output".to_string()))
        }
    }

    #[test]
    fn job_ids_are_parsed() {
        assert_eq!(parse_job_id("1234\n").as_deref(), Some("1234"));
        assert_eq!(parse_job_id("1234;cluster\n").as_deref(), Some("1234"));
        assert_eq!(
            parse_job_id("Submitted batch job 99\n").as_deref(),
            Some("99")
        );
        assert_eq!(parse_job_id(""), None);
        assert_eq!(parse_job_id("sbatch: error"), None);
    }

    #[test]
    fn job_ids_survive_login_banners() {
        assert_eq!(
            parse_job_id("Welcome to the cluster\n4242\n").as_deref(),
            Some("4242")
        );
        assert_eq!(
            parse_job_id("Submitted batch job 17\nquota: 80% used\n").as_deref(),
            Some("17")
        );
        assert_eq!(parse_job_id("Welcome to the cluster\n"), None);
    }

    #[tokio::test]
    async fn accepted_submission_without_an_id_is_unconfirmed() {
        let mut runner = Replay::new([(0, "Welcome to the cluster\n", "")]);
        let err = SlurmCommands::default()
            .submit(&mut runner, Path::new("job.sh"))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, SchedulerError::Unconfirmed(m) if m.contains("no job id")),
            "{err:?}"
        );
    }

    #[test]
    fn states_are_mapped() {
        assert_eq!(parse_state("PENDING"), Some(JobStatus::Pending));
        assert_eq!(parse_state("CONFIGURING"), Some(JobStatus::Pending));
        assert_eq!(parse_state("COMPLETING"), Some(JobStatus::Running));
        assert_eq!(parse_state("COMPLETED"), Some(JobStatus::Completed));
        assert_eq!(parse_state("CANCELLED by 1000"), Some(JobStatus::Cancelled));
        assert_eq!(parse_state("CANCELLED+"), Some(JobStatus::Cancelled));
        assert_eq!(parse_state("DEADLINE"), Some(JobStatus::Timeout));
        assert_eq!(parse_state("OUT_OF_MEMORY"), Some(JobStatus::Failed));
        assert_eq!(parse_state("WHATEVER"), None);
    }

    #[test]
    fn commands_use_the_bin_dir() {
        let commands = SlurmCommands::new(Some(PathBuf::from("/opt/slurm/bin")));
        assert_eq!(
            commands.sbatch(Path::new("/logs/j/job.sh")),
            ["/opt/slurm/bin/sbatch", "--parsable", "/logs/j/job.sh"]
        );
        assert_eq!(SlurmCommands::default().scancel("7"), ["scancel", "7"]);
    }

    #[tokio::test]
    async fn rejected_submission_carries_the_message() {
        let mut runner = Replay::new([(
            1,
            "",
            "sbatch: error: invalid partition specified: nope\n",
        )]);
        let err = SlurmCommands::default()
            .submit(&mut runner, Path::new("job.sh"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::Rejected(
                "sbatch: error: invalid partition specified: nope".to_string()
            )
        );
    }

    #[tokio::test]
    async fn queued_job_status_comes_from_squeue() {
        let mut runner = Replay::new([(0, "RUNNING\n", "")]);
        let report = SlurmCommands::default()
            .status(&mut runner, "42")
            .await
            .unwrap();
        assert_eq!(report, SchedulerReport::new(JobStatus::Running));
        assert_eq!(runner.seen.len(), 1);
    }

    #[tokio::test]
    async fn finished_job_status_comes_from_sacct() {
        let mut runner = Replay::new([
            (1, "", "slurm_load_jobs error: Invalid job id specified\n"),
            (0, "FAILED|3:0\n", ""),
        ]);
        let report = SlurmCommands::default()
            .status(&mut runner, "42")
            .await
            .unwrap();
        assert_eq!(
            report,
            SchedulerReport {
                status: JobStatus::Failed,
                exit_code: Some(3)
            }
        );
        assert_eq!(runner.seen[1][0], "sacct");
    }

    #[tokio::test]
    async fn job_unknown_to_both_tools_is_gone() {
        let mut runner = Replay::new([(0, "", ""), (0, "", "")]);
        assert_eq!(
            SlurmCommands::default().status(&mut runner, "42").await,
            Err(SchedulerError::UnknownJob("42".to_string()))
        );
    }

    #[tokio::test]
    async fn unreachable_controller_is_unavailable() {
        let mut runner = Replay::new([
            (1, "", "squeue: error: Unable to contact slurm controller\n"),
            (1, "", "sacct: error: Problem talking to the database\n"),
        ]);
        assert!(matches!(
            SlurmCommands::default().status(&mut runner, "42").await,
            Err(SchedulerError::Unavailable(m)) if m.contains("slurm controller")
        ));
    }
}
