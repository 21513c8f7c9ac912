//! Declarative job descriptions.
//!
//! A [`JobSpec`] is what a user writes (typically in the `[job]` table of a
//! TOML file); nothing in it has been checked yet. Use
//! [`ValidJobSpec::new`] to run the validator and obtain a value the planner
//! and request builder accept.

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::validate::validate;

/// The default container working directory.
pub const DEFAULT_CONTAINER_WORKDIR: &str = "/workspace";

/// The default directory under which job directories are allocated.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Represents a container to run the payload in.
///
/// Containers are launched through the pyxis `srun` plugin, so `name` refers
/// to an image or named container known to enroot on the compute nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ContainerSpec {
    /// The image or container name.
    pub name: String,
    /// Whether the user's home directory is mounted into the container.
    #[serde(default = "default_true")]
    pub mount_home: bool,
    /// The working directory of the payload inside the container.
    #[serde(default = "default_container_workdir")]
    pub workdir: String,
    /// Whether the container filesystem is writable.
    #[serde(default = "default_true")]
    pub writable: bool,
    /// Additional `host:container` mount pairs, in order.
    #[serde(default)]
    pub mounts: Vec<String>,
}

impl ContainerSpec {
    /// Creates a container specification with the default flags and no
    /// additional mounts.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_home: true,
            workdir: DEFAULT_CONTAINER_WORKDIR.to_string(),
            writable: true,
            mounts: Vec::new(),
        }
    }
}

/// Used as a serde default.
fn default_true() -> bool {
    true
}

/// Used as a serde default.
fn default_container_workdir() -> String {
    DEFAULT_CONTAINER_WORKDIR.to_string()
}

/// Used as a serde default.
fn default_one() -> u32 {
    1
}

/// Used as a serde default.
fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

/// Represents a user-supplied description of a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct JobSpec {
    /// The name of the job.
    pub job_name: String,
    /// The number of nodes to allocate.
    #[serde(default = "default_one")]
    pub num_nodes: u32,
    /// The number of processes launched on each node.
    #[serde(default = "default_one", alias = "ntasks_per_node")]
    pub processes_per_node: u32,
    /// The number of GPUs requested on each node.
    #[serde(default)]
    pub gpus_per_node: u32,
    /// The number of CPUs requested for each process.
    #[serde(default = "default_one")]
    pub cpus_per_task: u32,
    /// The wall-time limit in `HH:MM:SS` form.
    pub walltime: String,
    /// The partition (queue) to submit to.
    pub partition: String,
    /// The account to charge, if any.
    #[serde(default)]
    pub account: Option<String>,
    /// The quality of service, if any.
    #[serde(default)]
    pub qos: Option<String>,
    /// The directory under which the job directory is allocated.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// A directory visible from every allocated node.
    ///
    /// Required when more than one node is requested.
    #[serde(default)]
    pub shared_storage_root: Option<PathBuf>,
    /// A host directory used as the working directory of the job and, when a
    /// container is used, mounted at the container's working directory.
    #[serde(default)]
    pub workspace_mount: Option<PathBuf>,
    /// Shell commands run, in order, before the payload.
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// Extra environment variables for the payload.
    #[serde(default)]
    pub env_vars: IndexMap<String, String>,
    /// The container to run the payload in, if any.
    #[serde(default)]
    pub container: Option<ContainerSpec>,
    /// The login node to submit through when the scheduler is not reachable
    /// from this machine.
    #[serde(default)]
    pub login_node: Option<String>,
}

impl JobSpec {
    /// Creates a single-node job specification with default resources.
    pub fn new(
        job_name: impl Into<String>,
        partition: impl Into<String>,
        walltime: impl Into<String>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            num_nodes: 1,
            processes_per_node: 1,
            gpus_per_node: 0,
            cpus_per_task: 1,
            walltime: walltime.into(),
            partition: partition.into(),
            account: None,
            qos: None,
            log_dir: default_log_dir(),
            shared_storage_root: None,
            workspace_mount: None,
            setup_commands: Vec::new(),
            env_vars: IndexMap::new(),
            container: None,
            login_node: None,
        }
    }

    /// Gets the total number of processes across all nodes.
    pub fn world_size(&self) -> u64 {
        u64::from(self.num_nodes) * u64::from(self.processes_per_node)
    }

    /// Whether the job spans more than one node.
    pub fn is_multi_node(&self) -> bool {
        self.num_nodes > 1
    }
}

/// A positive wall-time limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Walltime(Duration);

impl Walltime {
    /// Gets the limit as a duration.
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Gets the limit in whole minutes, rounded up.
    ///
    /// Slurm's `--time` option treats a bare integer as minutes.
    pub fn minutes(&self) -> u64 {
        self.0.as_secs().div_ceil(60)
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        write!(
            f,
            "{:02}:{:02}:{:02}",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }
}

impl FromStr for Walltime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let (Some(h), Some(m), Some(sec), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err("expected `HH:MM:SS`".to_string());
        };

        let field = |v: &str, what: &str| -> Result<u64, String> {
            if v.is_empty() || !v.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("{what} `{v}` is not a number"));
            }
            v.parse::<u64>()
                .map_err(|e| format!("{what} `{v}` is out of range: {e}"))
        };

        let hours = field(h, "hours")?;
        let minutes = field(m, "minutes")?;
        let seconds = field(sec, "seconds")?;
        if minutes >= 60 {
            return Err(format!("minutes `{minutes}` must be less than 60"));
        }
        if seconds >= 60 {
            return Err(format!("seconds `{seconds}` must be less than 60"));
        }

        let total = hours
            .checked_mul(3600)
            .and_then(|h| h.checked_add(minutes * 60 + seconds))
            .ok_or_else(|| "wall-time is too large".to_string())?;
        if total == 0 {
            return Err("wall-time must be positive".to_string());
        }

        Ok(Self(Duration::from_secs(total)))
    }
}

/// A job specification that passed validation.
///
/// The wrapped specification can no longer be modified.
#[derive(Debug, Clone)]
pub struct ValidJobSpec {
    /// The validated specification.
    spec: JobSpec,
    /// The parsed wall-time limit.
    walltime: Walltime,
}

impl ValidJobSpec {
    /// Validates the given specification.
    pub fn new(spec: JobSpec) -> Result<Self, ConfigError> {
        validate(&spec)?;
        let walltime = spec
            .walltime
            .parse()
            .map_err(|reason| ConfigError::InvalidWalltime {
                job: spec.job_name.clone(),
                value: spec.walltime.clone(),
                reason,
            })?;
        Ok(Self { spec, walltime })
    }

    /// Gets the parsed wall-time limit.
    pub fn walltime(&self) -> Walltime {
        self.walltime
    }

    /// Consumes the value and returns the underlying specification.
    pub fn into_inner(self) -> JobSpec {
        self.spec
    }
}

impl Deref for ValidJobSpec {
    type Target = JobSpec;

    fn deref(&self) -> &Self::Target {
        &self.spec
    }
}
