//! Implementation of the configuration file.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use hpi_engine::EngineConfig;
use hpi_engine::JobSpec;
use serde::Deserialize;
use serde::Serialize;

/// Represents the configuration file read by the `hpi` tool.
///
/// The `[engine]` table configures how jobs are submitted and monitored and
/// the `[job]` table describes the job to submit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// The engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// The job to submit.
    #[serde(default)]
    pub job: Option<JobSpec>,
}

impl Config {
    /// Reads a configuration file.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read configuration file `{path}`",
                path = path.display()
            )
        })?;
        let config: Self = toml::from_str(&text).with_context(|| {
            format!(
                "failed to parse configuration file `{path}`",
                path = path.display()
            )
        })?;
        config.engine.validate().with_context(|| {
            format!(
                "invalid engine configuration in `{path}`",
                path = path.display()
            )
        })?;
        Ok(config)
    }

    /// Reads a configuration file if a path was given, otherwise returns the
    /// default configuration.
    pub fn read_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => Ok(Self::default()),
        }
    }

    /// Takes the job specification.
    pub fn take_job(&mut self, path: &Path) -> Result<JobSpec> {
        match self.job.take() {
            Some(job) => Ok(job),
            None => bail!(
                "configuration file `{path}` has no `[job]` table",
                path = path.display()
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn full_configuration_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpi.toml");
        std::fs::write(
            &path,
            r#"
[engine]
poll_interval_ms = 1000
constraint = "ARCH:X86"

[job]
job_name = "llama-sft"
num_nodes = 2
ntasks_per_node = 8
gpus_per_node = 8
walltime = "12:00:00"
partition = "gpu"
shared_storage_root = "/shared"
workspace_mount = "/shared/llama"
setup_commands = ["module load cuda"]
login_node = "login.cluster.example"

[job.env_vars]
NCCL_DEBUG = "INFO"

[job.container]
name = "nvcr.io/nvidia/pytorch:24.01-py3"
mounts = ["/data:/workspace/data"]
"#,
        )
        .unwrap();

        let mut config = Config::read(&path).unwrap();
        assert_eq!(config.engine.poll_interval_ms, 1000);
        let job = config.take_job(&path).unwrap();
        assert_eq!(job.processes_per_node, 8);
        assert_eq!(job.shared_storage_root, Some(PathBuf::from("/shared")));
        assert_eq!(job.env_vars["NCCL_DEBUG"], "INFO");
        let container = job.container.unwrap();
        assert!(container.mount_home);
        assert_eq!(container.workdir, "/workspace");
        assert!(config.take_job(&path).is_err());
    }

    #[test]
    fn invalid_engine_configuration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpi.toml");
        std::fs::write(&path, "[engine]\npoll_interval_ms = 0\n").unwrap();
        let err = Config::read(&path).unwrap_err();
        assert!(format!("{err:#}").contains("poll_interval_ms"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = Config::read(Path::new("/nonexistent/hpi.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/hpi.toml"));
    }
}
