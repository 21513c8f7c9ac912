//! Remote execution through a login gateway.
//!
//! A [`Gateway`] opens a [`GatewaySession`] to a login node. Sessions are
//! scoped: every session that was opened is closed again, whether or not the
//! commands run through it succeeded.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::config::SshConfig;

/// The output of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit status; `None` if the command was killed by a signal.
    pub status: Option<i32>,
    /// The captured standard output.
    pub stdout: String,
    /// The captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Describes a failed command using its standard error, falling back to
    /// its exit status.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }

        match self.status {
            Some(code) => format!("command exited with status {code}"),
            None => "command was terminated by a signal".to_string(),
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// An error from a gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The connection could not be established.
    #[error("failed to connect to `{address}`: {message}")]
    Connect {
        /// The gateway address.
        address: String,
        /// What went wrong.
        message: String,
    },
    /// A command could not be run on the gateway.
    #[error("failed to run a command on `{address}`: {message}")]
    Exec {
        /// The gateway address.
        address: String,
        /// What went wrong.
        message: String,
    },
    /// A command did not finish in time.
    #[error("command on `{address}` timed out after {secs} seconds")]
    Timeout {
        /// The gateway address.
        address: String,
        /// The timeout in seconds.
        secs: u64,
    },
}

/// Opens sessions to login nodes.
#[async_trait]
pub trait Gateway: fmt::Debug + Send + Sync {
    /// Connects to the given address.
    async fn connect(&self, address: &str) -> Result<Box<dyn GatewaySession>, GatewayError>;
}

/// An open connection to a login node.
#[async_trait]
pub trait GatewaySession: Send {
    /// Gets the address of the login node.
    fn address(&self) -> &str;

    /// Runs a shell command line on the login node.
    ///
    /// A command that runs but exits non-zero is not an error; inspect the
    /// returned [`CommandOutput`].
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, GatewayError>;

    /// Closes the session.
    async fn close(self: Box<Self>) -> Result<(), GatewayError>;
}

/// A gateway built on OpenSSH connection multiplexing.
///
/// Connecting starts a control master in the background; commands run through
/// the master and closing the session asks the master to exit.
#[derive(Debug, Clone)]
pub struct SshGateway {
    /// The SSH configuration.
    config: SshConfig,
}

impl SshGateway {
    /// Creates a new SSH gateway.
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Gateway for SshGateway {
    async fn connect(&self, address: &str) -> Result<Box<dyn GatewaySession>, GatewayError> {
        let connect_error = |message: String| GatewayError::Connect {
            address: address.to_string(),
            message,
        };

        let control_dir = tempfile::Builder::new()
            .prefix("hpi-ssh-")
            .tempdir()
            .map_err(|e| connect_error(format!("failed to create control directory: {e}")))?;

        let session = SshSession {
            program: self.config.program.clone(),
            options: self.config.options.clone(),
            address: address.to_string(),
            control_path: control_dir.path().join("control"),
            control_dir: Some(control_dir),
            timeout: self.config.command_timeout(),
            open: false,
        };

        let mut command = session.command();
        command.args(["-M", "-N", "-f"]).arg(address);
        debug!(?command, "starting SSH control master");

        let output = run(command, session.timeout)
            .await
            .map_err(|e| match e {
                RunError::Spawn(message) => connect_error(message),
                RunError::Timeout => GatewayError::Timeout {
                    address: address.to_string(),
                    secs: session.timeout.as_secs(),
                },
            })?;
        if !output.success() {
            return Err(connect_error(output.failure_message()));
        }

        let mut session = session;
        session.open = true;
        Ok(Box::new(session))
    }
}

/// A session multiplexed over an SSH control master.
#[derive(Debug)]
struct SshSession {
    /// The `ssh` program.
    program: String,
    /// Options passed to every invocation.
    options: Vec<String>,
    /// The login node address.
    address: String,
    /// The control socket path.
    control_path: PathBuf,
    /// The private directory holding the control socket.
    control_dir: Option<TempDir>,
    /// The timeout of a single command.
    timeout: Duration,
    /// Whether the control master is running.
    open: bool,
}

impl SshSession {
    /// Creates an `ssh` command bound to the control socket.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.options)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        command
    }

    /// Creates the blocking command that stops the control master.
    fn exit_command(&self) -> std::process::Command {
        let mut command = std::process::Command::new(&self.program);
        command
            .args(&self.options)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-O", "exit"])
            .arg(&self.address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

#[async_trait]
impl GatewaySession for SshSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn exec(&mut self, line: &str) -> Result<CommandOutput, GatewayError> {
        let mut command = self.command();
        command.arg(&self.address).arg(line);
        debug!(address = %self.address, command = line, "running remote command");

        let output = run(command, self.timeout).await.map_err(|e| match e {
            RunError::Spawn(message) => GatewayError::Exec {
                address: self.address.clone(),
                message,
            },
            RunError::Timeout => GatewayError::Timeout {
                address: self.address.clone(),
                secs: self.timeout.as_secs(),
            },
        })?;

        // `ssh` itself exits with 255 when the connection fails.
        if output.status == Some(255) {
            return Err(GatewayError::Exec {
                address: self.address.clone(),
                message: output.failure_message(),
            });
        }

        trace!(stdout = %output.stdout, stderr = %output.stderr, "remote command finished");
        Ok(output)
    }

    async fn close(mut self: Box<Self>) -> Result<(), GatewayError> {
        self.open = false;
        let mut command = self.command();
        command.args(["-O", "exit"]).arg(&self.address);
        debug!(address = %self.address, "stopping SSH control master");

        let output = run(command, self.timeout).await.map_err(|_| GatewayError::Exec {
            address: self.address.clone(),
            message: "failed to stop the SSH control master".to_string(),
        })?;
        if !output.success() {
            return Err(GatewayError::Exec {
                address: self.address.clone(),
                message: output.failure_message(),
            });
        }
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.open {
            warn!(
                address = %self.address,
                "SSH session was not closed; stopping the control master"
            );
            if let Err(e) = self.exit_command().status() {
                warn!(address = %self.address, "failed to stop the SSH control master: {e}");
            }
        }

        if let Some(dir) = self.control_dir.take()
            && let Err(e) = dir.close()
        {
            debug!("failed to remove SSH control directory: {e}");
        }
    }
}

/// Why running a local process failed.
#[derive(Debug)]
pub(crate) enum RunError {
    /// The process could not be spawned or awaited.
    Spawn(String),
    /// The process did not finish in time; it has been killed.
    Timeout,
}

/// Runs a command to completion, capturing its output.
pub(crate) async fn run(mut command: Command, timeout: Duration) -> Result<CommandOutput, RunError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(output.into()),
        Ok(Err(e)) => Err(RunError::Spawn(format!("failed to run `{program}`: {e}"))),
        Err(_) => Err(RunError::Timeout),
    }
}
