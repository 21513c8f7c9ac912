//! Implementation of hpi CLI commands.

use std::path::Path;

use anyhow::Result;
use colored::ColoredString;
use colored::Colorize as _;
use hpi_engine::Executor;
use hpi_engine::JobStatus;
use hpi_engine::JobSummary;

use crate::config::Config;

pub mod cancel;
pub mod logs;
pub mod status;
pub mod submit;

/// Creates an executor from an optional configuration file.
fn executor(config: Option<&Path>) -> Result<Executor> {
    Executor::new(Config::read_or_default(config)?.engine)
}

/// Colors a job status for the terminal.
fn colored_status(status: JobStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        JobStatus::Pending => text.normal(),
        JobStatus::Running => text.cyan(),
        JobStatus::Completed => text.green().bold(),
        JobStatus::Cancelled => text.yellow().bold(),
        JobStatus::Failed | JobStatus::Timeout => text.red().bold(),
    }
}

/// Prints the final summary of a job.
fn print_summary(summary: &JobSummary) {
    let exit = match summary.exit_code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    };
    println!(
        "job {id} (`{name}`) finished as {status}{exit}",
        id = summary.job_id,
        name = summary.job_name,
        status = colored_status(summary.status),
    );
    println!("  stdout: {}", summary.stdout.display());
    println!("  stderr: {}", summary.stderr.display());
}
