//! Building scheduler-agnostic submission requests.

use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::env::EnvLayers;
use crate::env::EnvValue;
use crate::error::ConfigError;
use crate::plan::DistributedPlan;
use crate::spec::ValidJobSpec;
use crate::transport::TransportMode;

/// The mount rendered for the user's home directory.
///
/// The variables are expanded on the compute node, so the home directory of
/// the account the job runs as is used, not the one of the submitting
/// machine.
pub const HOME_MOUNT: &str = "${HOME}:${HOME}";

/// The name of the file receiving the job's standard output.
pub const STDOUT_FILE_NAME: &str = "stdout";

/// The name of the file receiving the job's standard error.
pub const STDERR_FILE_NAME: &str = "stderr";

/// The name of the batch script in the job directory.
pub const SCRIPT_FILE_NAME: &str = "job.sh";

/// The name of the audit copy of the request in the job directory.
pub const REQUEST_FILE_NAME: &str = "request.json";

/// The format of the timestamp part of a job directory name.
const JOB_DIR_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";

/// The framework flag forcing a distributed-aware launcher.
const FORCE_TORCHRUN: &str = "FORCE_TORCHRUN";

/// The variable carrying the training configuration path.
const CONFIG_PATH: &str = "CONFIG_PATH";

/// A script run by an interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionPayload {
    /// The script to run.
    pub script: PathBuf,
    /// Arguments passed to the script.
    #[serde(default)]
    pub args: Vec<String>,
    /// The interpreter; defaults to the configured interpreter.
    #[serde(default)]
    pub interpreter: Option<String>,
}

impl FunctionPayload {
    /// Creates a payload running the given script without arguments.
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            interpreter: None,
        }
    }

    /// Adds arguments passed to the script.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Resolves the command line.
    fn argv(&self, default_interpreter: &str) -> Vec<String> {
        let mut argv = vec![
            self.interpreter
                .clone()
                .unwrap_or_else(|| default_interpreter.to_string()),
            self.script.display().to_string(),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// An arbitrary command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    /// The program followed by its arguments.
    pub argv: Vec<String>,
}

impl CommandPayload {
    /// Creates a command payload.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }
}

/// What a distributed payload runs on every process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedEntry {
    /// A script run by an interpreter.
    Function(FunctionPayload),
    /// An arbitrary command line.
    Command(CommandPayload),
}

/// A payload taking part in distributed training.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedPayload {
    /// What each process runs.
    pub entry: DistributedEntry,
    /// The training configuration, exported as `CONFIG_PATH`.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Whether nodes other than the first wait for the rendezvous port to
    /// accept connections before starting.
    #[serde(default)]
    pub wait_for_master: bool,
}

impl DistributedPayload {
    /// Creates a distributed payload from a function payload.
    pub fn function(function: FunctionPayload) -> Self {
        Self {
            entry: DistributedEntry::Function(function),
            config_path: None,
            wait_for_master: false,
        }
    }

    /// Creates a distributed payload running `llamafactory-cli train` with
    /// the given configuration.
    pub fn llamafactory(config_path: impl Into<PathBuf>) -> Self {
        let config_path = config_path.into();
        Self {
            entry: DistributedEntry::Command(CommandPayload::new([
                "llamafactory-cli".to_string(),
                "train".to_string(),
                config_path.display().to_string(),
            ])),
            config_path: Some(config_path),
            wait_for_master: false,
        }
    }
}

/// The payload of a job, selected explicitly by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// A script run by an interpreter.
    Function(FunctionPayload),
    /// A distributed training entrypoint.
    Distributed(DistributedPayload),
    /// An arbitrary command line.
    Command(CommandPayload),
}

impl Payload {
    /// Gets the kind of the payload.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Function(_) => PayloadKind::Function,
            Self::Distributed(_) => PayloadKind::Distributed,
            Self::Command(_) => PayloadKind::Command,
        }
    }

    /// Checks that the payload runs something.
    pub fn validate(&self, job: &str) -> Result<(), ConfigError> {
        let empty = match self {
            Self::Function(f)
            | Self::Distributed(DistributedPayload {
                entry: DistributedEntry::Function(f),
                ..
            }) => f.script.as_os_str().is_empty(),
            Self::Command(c)
            | Self::Distributed(DistributedPayload {
                entry: DistributedEntry::Command(c),
                ..
            }) => c.argv.first().is_none_or(|p| p.is_empty()),
        };

        if empty {
            return Err(ConfigError::EmptyPayload {
                job: job.to_string(),
            });
        }
        Ok(())
    }
}

/// The kind of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// A script run by an interpreter.
    Function,
    /// A distributed training entrypoint.
    Distributed,
    /// An arbitrary command line.
    Command,
}

/// Resource directives passed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDirectives {
    /// The job name.
    pub job_name: String,
    /// The number of nodes.
    pub nodes: u32,
    /// The number of processes per node.
    pub tasks_per_node: u32,
    /// The number of CPUs per process.
    pub cpus_per_task: u32,
    /// The number of GPUs per node.
    pub gpus_per_node: u32,
    /// The wall-time limit in minutes.
    pub time_minutes: u64,
    /// The partition.
    pub partition: String,
    /// The account, if any.
    pub account: Option<String>,
    /// The quality of service, if any.
    pub qos: Option<String>,
    /// The node feature constraint, if any.
    pub constraint: Option<String>,
    /// Additional raw `sbatch` arguments.
    pub extra_args: Vec<String>,
}

/// How the payload is wrapped in a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInvocation {
    /// The image or container name.
    pub name: String,
    /// The `host:container` mounts in the order they are passed.
    pub mounts: Vec<String>,
    /// The payload's working directory inside the container.
    pub workdir: String,
    /// Whether the container filesystem is writable.
    pub writable: bool,
}

/// Per-process steps run before the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    /// Whether global rank 0 logs in to Hugging Face when a token is
    /// available.
    pub hf_login: bool,
    /// A file holding a Hugging Face token.
    pub hf_token_file: Option<PathBuf>,
    /// Whether non-zero node ranks wait for the rendezvous port.
    pub wait_for_master: bool,
}

/// A fully resolved submission.
///
/// Built once by the [`RequestBuilder`] and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    /// The kind of payload this request runs.
    payload_kind: PayloadKind,
    /// The resolved payload command line.
    command: Vec<String>,
    /// Setup commands run, in order, before the payload.
    setup: Vec<String>,
    /// The resource directives.
    directives: ResourceDirectives,
    /// The resolved environment.
    environment: IndexMap<String, EnvValue>,
    /// The host working directory.
    working_dir: PathBuf,
    /// The container wrapping, if any.
    container: Option<ContainerInvocation>,
    /// Per-process bootstrap steps.
    bootstrap: Bootstrap,
    /// The job directory.
    job_dir: PathBuf,
    /// How the request is submitted.
    transport: TransportMode,
    /// When the request was built.
    submitted_at: DateTime<Utc>,
}

impl SubmissionRequest {
    /// Gets the job name.
    pub fn job_name(&self) -> &str {
        &self.directives.job_name
    }

    /// Gets the kind of payload.
    pub fn payload_kind(&self) -> PayloadKind {
        self.payload_kind
    }

    /// Gets the payload command line.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Gets the setup commands.
    pub fn setup(&self) -> &[String] {
        &self.setup
    }

    /// Gets the resource directives.
    pub fn directives(&self) -> &ResourceDirectives {
        &self.directives
    }

    /// Gets the resolved environment.
    pub fn environment(&self) -> &IndexMap<String, EnvValue> {
        &self.environment
    }

    /// Gets the host working directory.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Gets the container wrapping, if any.
    pub fn container(&self) -> Option<&ContainerInvocation> {
        self.container.as_ref()
    }

    /// Gets the per-process bootstrap steps.
    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    /// Gets the job directory.
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// Gets the path receiving the job's standard output.
    pub fn stdout_path(&self) -> PathBuf {
        self.job_dir.join(STDOUT_FILE_NAME)
    }

    /// Gets the path receiving the job's standard error.
    pub fn stderr_path(&self) -> PathBuf {
        self.job_dir.join(STDERR_FILE_NAME)
    }

    /// Gets the path of the batch script.
    pub fn script_path(&self) -> PathBuf {
        self.job_dir.join(SCRIPT_FILE_NAME)
    }

    /// Gets how the request is submitted.
    pub fn transport(&self) -> &TransportMode {
        &self.transport
    }

    /// Gets when the request was built.
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

/// Builds [`SubmissionRequest`]s.
#[derive(Debug, Clone)]
pub struct RequestBuilder<'a> {
    /// The engine configuration.
    config: &'a EngineConfig,
    /// The environment inherited from the submitting process.
    base_env: IndexMap<String, String>,
}

impl<'a> RequestBuilder<'a> {
    /// Creates a builder with an empty base environment.
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            base_env: IndexMap::new(),
        }
    }

    /// Sets the environment inherited from the submitting process.
    pub fn with_base_env(mut self, base_env: IndexMap<String, String>) -> Self {
        self.base_env = base_env;
        self
    }

    /// Builds the request.
    ///
    /// The job directory is derived from the job name and `submitted_at`, so
    /// it is known before anything is submitted.
    pub fn build(
        &self,
        spec: &ValidJobSpec,
        plan: &DistributedPlan,
        payload: &Payload,
        submitted_at: DateTime<Utc>,
    ) -> SubmissionRequest {
        let job_dir = job_dir(&spec.log_dir, &spec.job_name, submitted_at);

        let (command, framework, bootstrap) = match payload {
            Payload::Function(f) => (
                f.argv(&self.config.interpreter),
                IndexMap::new(),
                Bootstrap::default(),
            ),
            Payload::Command(c) => (c.argv.clone(), IndexMap::new(), Bootstrap::default()),
            Payload::Distributed(d) => {
                let command = match &d.entry {
                    DistributedEntry::Function(f) => f.argv(&self.config.interpreter),
                    DistributedEntry::Command(c) => c.argv.clone(),
                };

                let mut framework = IndexMap::new();
                if self.config.force_torchrun {
                    framework.insert(FORCE_TORCHRUN.to_string(), EnvValue::literal("1"));
                }
                if let Some(path) = &d.config_path {
                    framework.insert(
                        CONFIG_PATH.to_string(),
                        EnvValue::literal(path.display().to_string()),
                    );
                }

                let bootstrap = Bootstrap {
                    hf_login: true,
                    hf_token_file: self.config.hf_token_file.clone(),
                    wait_for_master: d.wait_for_master,
                };
                (command, framework, bootstrap)
            }
        };

        let literals = |env: &IndexMap<String, String>| {
            env.iter()
                .map(|(k, v)| (k.clone(), EnvValue::literal(v)))
                .collect::<IndexMap<_, _>>()
        };
        let environment = EnvLayers {
            base: literals(&self.base_env),
            user: literals(&spec.env_vars),
            framework,
            distributed: plan.environment(),
        }
        .resolve();

        let container = spec.container.as_ref().map(|c| {
            let mut mounts = Vec::with_capacity(c.mounts.len() + 2);
            if c.mount_home {
                mounts.push(HOME_MOUNT.to_string());
            }
            if let Some(workspace) = &spec.workspace_mount {
                mounts.push(format!("{}:{}", workspace.display(), c.workdir));
            }
            mounts.extend(c.mounts.iter().cloned());
            ContainerInvocation {
                name: c.name.clone(),
                mounts,
                workdir: c.workdir.clone(),
                writable: c.writable,
            }
        });

        let working_dir = spec
            .workspace_mount
            .clone()
            .or_else(|| spec.shared_storage_root.clone())
            .unwrap_or_else(|| job_dir.clone());

        let directives = ResourceDirectives {
            job_name: spec.job_name.clone(),
            nodes: spec.num_nodes,
            tasks_per_node: spec.processes_per_node,
            cpus_per_task: spec.cpus_per_task,
            gpus_per_node: spec.gpus_per_node,
            time_minutes: spec.walltime().minutes(),
            partition: spec.partition.clone(),
            account: spec.account.clone(),
            qos: spec.qos.clone(),
            constraint: self.config.constraint.clone(),
            extra_args: self.config.extra_sbatch_args.clone(),
        };

        let transport = match &spec.login_node {
            Some(gateway) => TransportMode::Remote {
                gateway: gateway.clone(),
            },
            None => TransportMode::Local,
        };

        SubmissionRequest {
            payload_kind: payload.kind(),
            command,
            setup: spec.setup_commands.clone(),
            directives,
            environment,
            working_dir,
            container,
            bootstrap,
            job_dir,
            transport,
            submitted_at,
        }
    }
}

/// Computes the job directory for a job submitted at the given time.
pub fn job_dir(log_dir: &Path, job_name: &str, submitted_at: DateTime<Utc>) -> PathBuf {
    log_dir.join(format!(
        "{job_name}-{timestamp}",
        timestamp = submitted_at.format(JOB_DIR_TIMESTAMP_FORMAT)
    ))
}

#[cfg(test)]
mod test {
    use chrono::Duration;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::config::PortRange;
    use crate::plan::MASTER_PORT;
    use crate::plan::NODE_RANK;
    use crate::plan::Planner;
    use crate::spec::ContainerSpec;
    use crate::spec::JobSpec;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap()
    }

    fn build(spec: JobSpec, payload: &Payload, seed: u64, when: DateTime<Utc>) -> SubmissionRequest {
        let config = EngineConfig::default();
        let spec = ValidJobSpec::new(spec).unwrap();
        let plan =
            Planner::new(PortRange::default()).plan(&spec, &mut StdRng::seed_from_u64(seed));
        RequestBuilder::new(&config)
            .with_base_env([("BASE".to_string(), "1".to_string())].into())
            .build(&spec, &plan, payload, when)
    }

    fn command() -> Payload {
        Payload::Command(CommandPayload::new(["echo", "hello"]))
    }

    #[test]
    fn single_node_job_without_container() {
        let mut spec = JobSpec::new("test-job", "gpu", "01:00:00");
        spec.gpus_per_node = 2;
        let request = build(spec, &command(), 1, at());

        assert!(request.container().is_none());
        assert_eq!(request.directives().nodes, 1);
        assert_eq!(request.directives().tasks_per_node, 1);
        assert_eq!(request.directives().gpus_per_node, 2);
        assert_eq!(request.directives().time_minutes, 60);
        assert_eq!(request.command(), ["echo", "hello"]);
        assert_eq!(request.transport(), &TransportMode::Local);
        assert_eq!(
            request.job_dir(),
            Path::new("logs/test-job-20261016-093000-000000")
        );
        assert_eq!(
            request.stdout_path(),
            Path::new("logs/test-job-20261016-093000-000000/stdout")
        );
    }

    #[test]
    fn distributed_values_win_over_user_values() {
        let mut spec = JobSpec::new("test-job", "gpu", "01:00:00");
        spec.env_vars.insert(MASTER_PORT.to_string(), "1".to_string());
        spec.env_vars.insert(NODE_RANK.to_string(), "9".to_string());
        spec.env_vars.insert("MY_FLAG".to_string(), "on".to_string());
        spec.env_vars.insert("BASE".to_string(), "2".to_string());
        let request = build(spec, &command(), 1, at());
        let env = request.environment();

        assert_ne!(env[MASTER_PORT].as_literal(), Some("1"));
        assert_eq!(
            env[NODE_RANK],
            EnvValue::TaskExpr("$SLURM_NODEID".to_string())
        );
        assert_eq!(env["MY_FLAG"].as_literal(), Some("on"));
        assert_eq!(env["BASE"].as_literal(), Some("2"));
    }

    #[test]
    fn framework_flags_sit_between_user_and_distributed() {
        let mut spec = JobSpec::new("train", "gpu", "01:00:00");
        spec.env_vars.insert("FORCE_TORCHRUN".to_string(), "0".to_string());
        let payload = Payload::Distributed(DistributedPayload::llamafactory("/cfg/train.yaml"));
        let request = build(spec, &payload, 1, at());
        let env = request.environment();

        assert_eq!(env["FORCE_TORCHRUN"].as_literal(), Some("1"));
        assert_eq!(env["CONFIG_PATH"].as_literal(), Some("/cfg/train.yaml"));
        assert_eq!(
            request.command(),
            ["llamafactory-cli", "train", "/cfg/train.yaml"]
        );
        assert!(request.bootstrap().hf_login);
        assert_eq!(request.payload_kind(), PayloadKind::Distributed);
    }

    #[test]
    fn builds_differ_only_in_port_and_job_dir() {
        let mut spec = JobSpec::new("train", "gpu", "02:00:00");
        spec.num_nodes = 4;
        spec.processes_per_node = 2;
        spec.shared_storage_root = Some(PathBuf::from("/shared"));
        spec.env_vars.insert("A".to_string(), "b".to_string());
        let payload = Payload::Function(FunctionPayload::new("train.py").with_args(["--fast"]));

        let first = build(spec.clone(), &payload, 1, at());
        let second = build(spec, &payload, 2, at() + Duration::milliseconds(3));

        assert_eq!(first.directives(), second.directives());
        assert_eq!(first.command(), second.command());
        assert_eq!(first.command(), ["python3", "train.py", "--fast"]);
        assert_ne!(first.job_dir(), second.job_dir());

        let strip = |r: &SubmissionRequest| {
            let mut env = r.environment().clone();
            env.shift_remove(MASTER_PORT);
            env
        };
        assert_eq!(strip(&first), strip(&second));
    }

    #[test]
    fn container_mounts_follow_defaults_in_order() {
        let mut spec = JobSpec::new("test-container-job", "gpu", "00:30:00");
        spec.workspace_mount = Some(PathBuf::from("/test/workspace"));
        let mut container = ContainerSpec::new("test-container");
        container.mounts.push("/data:/workspace/data".to_string());
        spec.container = Some(container);

        let request = build(spec, &command(), 1, at());
        let container = request.container().unwrap();
        assert_eq!(
            container.mounts,
            [
                HOME_MOUNT,
                "/test/workspace:/workspace",
                "/data:/workspace/data"
            ]
        );
        assert_eq!(container.workdir, "/workspace");
        assert_eq!(request.working_dir(), Path::new("/test/workspace"));
    }

    #[test]
    fn login_node_selects_remote_transport() {
        let mut spec = JobSpec::new("test-job", "gpu", "00:30:00");
        spec.login_node = Some("test.cluster.com".to_string());
        let request = build(spec, &command(), 1, at());
        assert_eq!(
            request.transport(),
            &TransportMode::Remote {
                gateway: "test.cluster.com".to_string()
            }
        );
    }

    #[test]
    fn empty_payloads_are_rejected() {
        assert!(matches!(
            Payload::Command(CommandPayload { argv: vec![] }).validate("j"),
            Err(ConfigError::EmptyPayload { .. })
        ));
        assert!(Payload::Function(FunctionPayload::new("")).validate("j").is_err());
        assert!(command().validate("j").is_ok());
    }
}
