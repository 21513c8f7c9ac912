//! The hpi command line tool.

use std::io::IsTerminal;
use std::io::stderr;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use git_testament::git_testament;
use git_testament::render_testament;
use hpi::commands;
use tracing::level_filters::LevelFilter;
use tracing_log::AsTrace;
use tracing_subscriber::EnvFilter;

git_testament!(TESTAMENT);

#[derive(Subcommand)]
enum Commands {
    /// Submits the job described by a configuration file.
    ///
    /// The configuration file holds an `[engine]` table configuring the
    /// submission and a `[job]` table describing the resources of the job.
    /// The command line to run follows `--`.
    Submit(commands::submit::Args),

    /// Prints the status of a submitted job.
    Status(commands::status::Args),

    /// Cancels a submitted job.
    Cancel(commands::cancel::Args),

    /// Prints the output of a submitted job, following it until it finishes.
    Logs(commands::logs::Args),
}

#[derive(Parser)]
#[command(author, version = render_testament!(TESTAMENT), propagate_version = true, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    verbose: Verbosity,
}

/// Builds the log filter.
///
/// `RUST_LOG` style directives take precedence over the verbosity flags.
fn log_filter(level: LevelFilter, directives: Option<&str>) -> anyhow::Result<EnvFilter> {
    match directives {
        Some(directives) if !directives.trim().is_empty() => {
            Ok(EnvFilter::builder().parse(directives)?)
        }
        _ => Ok(EnvFilter::default().add_directive(level.into())),
    }
}

pub async fn inner() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let filter = log_filter(
        cli.verbose.log_level_filter().as_trace(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
    )?;
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Submit(args) => commands::submit::submit(args).await,
        Commands::Status(args) => commands::status::status(args).await,
        Commands::Cancel(args) => commands::cancel::cancel(args).await,
        Commands::Logs(args) => commands::logs::logs(args).await,
    }
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(1);
    }
}
