//! Experiment tracking sinks.
//!
//! Trackers receive numeric points while jobs are monitored. Delivery is best
//! effort: a failing tracker is logged and skipped, never allowed to affect
//! the job or the monitor.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::io::AsyncWriteExt as _;

/// The metric holding the lifecycle stage of the job status.
pub const STATUS_STAGE_METRIC: &str = "job/status_stage";

/// The metric holding the seconds elapsed since submission.
pub const ELAPSED_SECONDS_METRIC: &str = "job/elapsed_seconds";

/// A sink for tracking records.
#[async_trait]
pub trait Tracker: fmt::Debug + Send + Sync {
    /// Records a mapping of metric names to values at the given step.
    async fn record(&self, step: u64, values: &IndexMap<String, f64>) -> Result<()>;
}

/// A record written by the [`JsonLinesTracker`].
#[derive(Debug, Serialize)]
struct Record<'a> {
    /// The step.
    step: u64,
    /// The recorded values.
    values: &'a IndexMap<String, f64>,
}

/// A tracker appending one JSON object per record to a file.
#[derive(Debug, Clone)]
pub struct JsonLinesTracker {
    /// The file records are appended to.
    path: PathBuf,
}

impl JsonLinesTracker {
    /// Creates a tracker appending to the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Gets the path of the file records are appended to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Tracker for JsonLinesTracker {
    async fn record(&self, step: u64, values: &IndexMap<String, f64>) -> Result<()> {
        let mut line = serde_json::to_string(&Record { step, values })?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| {
                format!(
                    "failed to open tracking file `{path}`",
                    path = self.path.display()
                )
            })?;
        file.write_all(line.as_bytes()).await.with_context(|| {
            format!(
                "failed to write tracking file `{path}`",
                path = self.path.display()
            )
        })?;
        file.flush().await?;
        Ok(())
    }
}
