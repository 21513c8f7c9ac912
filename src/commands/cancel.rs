//! Implementation of the `cancel` subcommand.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use hpi_engine::JobHandle;

use super::executor;

/// Arguments for the `cancel` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The job directory printed when the job was submitted.
    pub job_dir: PathBuf,

    /// The configuration file whose `[engine]` table is used.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Runs the `cancel` subcommand.
///
/// The job is cancelled through the same transport it was submitted with.
pub async fn cancel(args: Args) -> Result<()> {
    let handle = JobHandle::load(&args.job_dir)?;
    executor(args.config.as_deref())?.cancel(&handle).await?;
    println!(
        "requested cancellation of job {id} (`{name}`)",
        id = handle.job_id(),
        name = handle.job_name()
    );
    Ok(())
}
