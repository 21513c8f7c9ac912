//! Implementation of engine configuration.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

/// The default first port of the rendezvous port range.
pub const DEFAULT_MIN_PORT: u16 = 30000;

/// The default last port of the rendezvous port range.
pub const DEFAULT_MAX_PORT: u16 = 50000;

/// The default interval between status polls, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// The default number of consecutive transient poll failures tolerated.
pub const DEFAULT_MAX_CONSECUTIVE_POLL_FAILURES: u32 = 5;

/// The default interpreter for function payloads.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Represents the engine configuration.
///
/// A single value of this type is handed to the
/// [`Executor`](crate::Executor) when it is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct EngineConfig {
    /// The inclusive range the rendezvous port is drawn from.
    pub port_range: PortRange,
    /// The interval between status polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// How many consecutive transient poll failures are tolerated before
    /// monitoring gives up.
    pub max_consecutive_poll_failures: u32,
    /// The interpreter used to run function and distributed payloads.
    pub interpreter: String,
    /// Whether `FORCE_TORCHRUN=1` is exported for distributed payloads.
    pub force_torchrun: bool,
    /// A node feature constraint passed as `--constraint`.
    pub constraint: Option<String>,
    /// Additional `sbatch` arguments, rendered as `#SBATCH` directives.
    pub extra_sbatch_args: Vec<String>,
    /// Names of variables of the submitting process that form the base
    /// environment of every job.
    pub inherit_env: Vec<String>,
    /// A file holding a Hugging Face token, read on the rank 0 node when
    /// `HUGGING_FACE_HUB_TOKEN` is not set there.
    pub hf_token_file: Option<PathBuf>,
    /// The directory containing the Slurm binaries.
    ///
    /// If unset, they are looked up on `PATH` (locally or on the login node).
    pub slurm_bin_dir: Option<PathBuf>,
    /// Configuration of the SSH gateway.
    pub ssh: SshConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_consecutive_poll_failures: DEFAULT_MAX_CONSECUTIVE_POLL_FAILURES,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            force_torchrun: true,
            constraint: None,
            extra_sbatch_args: Vec::new(),
            inherit_env: Vec::new(),
            hf_token_file: None,
            slurm_bin_dir: None,
            ssh: SshConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.port_range.validate()?;
        if self.poll_interval_ms == 0 {
            bail!("configuration value `poll_interval_ms` cannot be zero");
        }
        if self.max_consecutive_poll_failures == 0 {
            bail!("configuration value `max_consecutive_poll_failures` cannot be zero");
        }
        if self.interpreter.trim().is_empty() {
            bail!("configuration value `interpreter` cannot be empty");
        }
        self.ssh.validate()?;
        Ok(())
    }

    /// Gets the poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// An inclusive range of TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PortRange {
    /// The first port in the range.
    pub min: u16,
    /// The last port in the range.
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_PORT,
            max: DEFAULT_MAX_PORT,
        }
    }
}

impl PortRange {
    /// Validates the range.
    pub fn validate(&self) -> Result<()> {
        if self.min == 0 {
            bail!("configuration value `port_range.min` cannot be zero");
        }
        if self.min > self.max {
            bail!(
                "configuration value `port_range` is empty: {min} is greater than {max}",
                min = self.min,
                max = self.max
            );
        }
        Ok(())
    }

    /// Gets the range as a [`RangeInclusive`].
    pub fn to_range(self) -> RangeInclusive<u16> {
        self.min..=self.max
    }
}

/// Configuration of the OpenSSH gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct SshConfig {
    /// The `ssh` program to run.
    pub program: String,
    /// Options passed to every `ssh` invocation.
    pub options: Vec<String>,
    /// How long a single remote command may take, in seconds.
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            options: [
                "-q",
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "ConnectTimeout=10",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            command_timeout_secs: 60,
        }
    }
}

impl SshConfig {
    /// Validates the SSH configuration.
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            bail!("configuration value `ssh.program` cannot be empty");
        }
        if self.command_timeout_secs == 0 {
            bail!("configuration value `ssh.command_timeout_secs` cannot be zero");
        }
        Ok(())
    }

    /// Gets the remote command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.port_range.to_range(), 30000..=50000);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
poll_interval_ms = 250
constraint = "ARCH:X86"

[port_range]
min = 40000
max = 40010
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.constraint.as_deref(), Some("ARCH:X86"));
        assert_eq!(config.port_range.to_range(), 40000..=40010);
        assert_eq!(config.interpreter, DEFAULT_INTERPRETER);
        assert_eq!(config.ssh.program, "ssh");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = EngineConfig::default();
        config.port_range = PortRange { min: 5, max: 4 };
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_consecutive_poll_failures = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<EngineConfig>("nope = 1").is_err());
    }
}
