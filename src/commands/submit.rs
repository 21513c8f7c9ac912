//! Implementation of the `submit` subcommand.

use std::path::PathBuf;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::ValueEnum;
use hpi_engine::CommandPayload;
use hpi_engine::DistributedEntry;
use hpi_engine::DistributedPayload;
use hpi_engine::Executor;
use hpi_engine::FunctionPayload;
use hpi_engine::JobStatus;
use hpi_engine::Payload;

use super::print_summary;
use crate::config::Config;

/// The kind of payload to submit.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Runs the arguments as a command line.
    #[default]
    Command,
    /// Runs the first argument as a script with the configured interpreter.
    Function,
    /// Runs the arguments as a command line on every distributed process.
    Distributed,
    /// Runs `llamafactory-cli train` with the training configuration.
    LlamaFactory,
}

/// Arguments for the `submit` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The configuration file with the `[job]` table to submit.
    pub config: PathBuf,

    /// The kind of payload to submit.
    #[arg(long, value_enum, default_value_t)]
    pub mode: Mode,

    /// The training configuration, exported to the job as `CONFIG_PATH`.
    #[arg(long, value_name = "PATH")]
    pub training_config: Option<PathBuf>,

    /// Makes nodes other than the first wait for the rendezvous port.
    #[arg(long)]
    pub wait_for_master: bool,

    /// Follows the output of the job until it finishes.
    #[arg(short, long)]
    pub follow: bool,

    /// The command line (or script and its arguments) to run.
    #[arg(last = true)]
    pub argv: Vec<String>,
}

impl Args {
    /// Builds the payload selected by the arguments.
    fn payload(self) -> Result<Payload> {
        match self.mode {
            Mode::Command | Mode::Function
                if self.training_config.is_some() || self.wait_for_master =>
            {
                bail!("`--training-config` and `--wait-for-master` require a distributed mode")
            }
            Mode::Command => Ok(Payload::Command(CommandPayload::new(self.argv))),
            Mode::Function => Ok(Payload::Function(function(self.argv)?)),
            Mode::Distributed => Ok(Payload::Distributed(DistributedPayload {
                entry: DistributedEntry::Command(CommandPayload::new(self.argv)),
                config_path: self.training_config,
                wait_for_master: self.wait_for_master,
            })),
            Mode::LlamaFactory => {
                let Some(config_path) = self.training_config else {
                    bail!("`--mode llama-factory` requires `--training-config`");
                };
                if !self.argv.is_empty() {
                    bail!("`--mode llama-factory` does not take a command line");
                }
                Ok(Payload::Distributed(DistributedPayload {
                    wait_for_master: self.wait_for_master,
                    ..DistributedPayload::llamafactory(config_path)
                }))
            }
        }
    }
}

/// Builds a function payload from a script followed by its arguments.
fn function(argv: Vec<String>) -> Result<FunctionPayload> {
    let mut argv = argv.into_iter();
    let Some(script) = argv.next() else {
        bail!("`--mode function` requires a script to run");
    };
    Ok(FunctionPayload::new(script).with_args(argv))
}

/// Runs the `submit` subcommand.
pub async fn submit(args: Args) -> Result<()> {
    let mut config = Config::read(&args.config)?;
    let spec = config.take_job(&args.config)?;
    let follow = args.follow;
    let payload = args.payload()?;

    let executor = Executor::new(config.engine)?;
    let handle = executor.submit(spec, payload).await?;
    println!(
        "submitted job {id} (`{name}`)",
        id = handle.job_id(),
        name = handle.job_name()
    );
    println!("  job directory: {}", handle.job_dir().display());
    println!("  stdout: {}", handle.stdout().display());
    println!("  stderr: {}", handle.stderr().display());

    if !follow {
        return Ok(());
    }

    let summary = super::logs::follow(&executor, &handle).await?;
    print_summary(&summary);
    if summary.status != JobStatus::Completed {
        bail!(
            "job {id} finished as {status}",
            id = summary.job_id,
            status = summary.status
        );
    }
    Ok(())
}
