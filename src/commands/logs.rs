//! Implementation of the `logs` subcommand.

use std::path::PathBuf;
use std::pin::pin;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt as _;
use hpi_engine::Executor;
use hpi_engine::JobHandle;
use hpi_engine::JobSummary;
use hpi_engine::LogEvent;
use hpi_engine::LogStream;

use super::executor;
use super::print_summary;

/// Arguments for the `logs` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The job directory printed when the job was submitted.
    pub job_dir: PathBuf,

    /// The configuration file whose `[engine]` table is used.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Prints the output written so far instead of following the job.
    #[arg(long)]
    pub no_follow: bool,
}

/// Runs the `logs` subcommand.
pub async fn logs(args: Args) -> Result<()> {
    let handle = JobHandle::load(&args.job_dir)?;

    if args.no_follow {
        for path in [handle.stdout(), handle.stderr()] {
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => print!("{contents}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!(
                        "failed to read `{path}`",
                        path = path.display()
                    )));
                }
            }
        }
        return Ok(());
    }

    let executor = executor(args.config.as_deref())?;
    let summary = follow(&executor, &handle).await?;
    print_summary(&summary);
    Ok(())
}

/// Follows the output of a job until it finishes.
///
/// Lines of the job's standard output are printed to standard output and
/// lines of its standard error to standard error.
pub(crate) async fn follow(executor: &Executor, handle: &JobHandle) -> Result<JobSummary> {
    let mut events = pin!(executor.stream(handle));
    while let Some(event) = events.next().await {
        match event? {
            LogEvent::Line {
                stream: LogStream::Stdout,
                line,
            } => println!("{line}"),
            LogEvent::Line {
                stream: LogStream::Stderr,
                line,
            } => eprintln!("{line}"),
            LogEvent::Finished(summary) => return Ok(summary),
        }
    }

    Ok(executor.wait(handle).await?)
}
