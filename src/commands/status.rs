//! Implementation of the `status` subcommand.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use hpi_engine::JobHandle;

use super::colored_status;
use super::executor;

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The job directory printed when the job was submitted.
    pub job_dir: PathBuf,

    /// The configuration file whose `[engine]` table is used.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Runs the `status` subcommand.
pub async fn status(args: Args) -> Result<()> {
    let handle = JobHandle::load(&args.job_dir)?;
    let executor = executor(args.config.as_deref())?;
    let status = executor.status(&handle).await?;
    println!(
        "job {id} (`{name}`): {status}",
        id = handle.job_id(),
        name = handle.job_name(),
        status = colored_status(status)
    );
    Ok(())
}
