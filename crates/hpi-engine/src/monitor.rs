//! Monitoring of submitted jobs.
//!
//! The monitor owns no background task. Every operation runs on the caller's
//! task: [`JobMonitor::poll`] queries the scheduler once,
//! [`JobMonitor::next_change`] and [`JobMonitor::wait`] sleep between polls,
//! and [`JobMonitor::stream_logs`] is a lazy stream that only reads when it is
//! polled.
//!
//! Observations of a job are monotonic in lifecycle stage. A scheduler answer
//! that would move a job backwards is treated as a stale read and replaced by
//! the last observation. Terminal observations are absorbing and are answered
//! without querying the scheduler again.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use futures::stream;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncSeekExt as _;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::MonitorError;
use crate::job::JobHandle;
use crate::job::JobStatus;
use crate::job::JobSummary;
use crate::job::LogEvent;
use crate::job::LogStream;
use crate::scheduler::SchedulerReport;
use crate::tracking::ELAPSED_SECONDS_METRIC;
use crate::tracking::STATUS_STAGE_METRIC;
use crate::tracking::Tracker;
use crate::transport::Transport;

/// The last observation of a job.
#[derive(Debug, Clone, Copy)]
struct Observation {
    /// The observed report.
    report: SchedulerReport,
    /// The number of scheduler answers received for the job.
    count: u64,
}

/// Observes jobs through the transport they were submitted with.
///
/// The last observation of every job is remembered until the job is
/// [forgotten](Self::forget); a long-lived monitor watching many jobs should
/// forget them once their summaries have been consumed.
#[derive(Debug)]
pub struct JobMonitor {
    /// The transport used to query the scheduler.
    transport: Transport,
    /// The interval between polls.
    poll_interval: Duration,
    /// The number of consecutive transient failures tolerated.
    max_failures: u32,
    /// The registered trackers.
    trackers: Vec<Arc<dyn Tracker>>,
    /// The last observation of every job, keyed by job directory.
    observed: Mutex<HashMap<PathBuf, Observation>>,
}

impl JobMonitor {
    /// Creates a new monitor.
    pub fn new(transport: Transport, config: &EngineConfig) -> Self {
        Self {
            transport,
            poll_interval: config.poll_interval(),
            max_failures: config.max_consecutive_poll_failures,
            trackers: Vec::new(),
            observed: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a tracker notified on every status change.
    pub fn add_tracker(&mut self, tracker: Arc<dyn Tracker>) {
        self.trackers.push(tracker);
    }

    /// Gets the last observed status of a job, if it was observed.
    pub fn last_status(&self, handle: &JobHandle) -> Option<JobStatus> {
        self.observed
            .lock()
            .get(handle.job_dir())
            .map(|o| o.report.status)
    }

    /// Drops the remembered observation of a job and returns its last
    /// status.
    ///
    /// A forgotten job is queried from the scheduler again the next time it
    /// is observed.
    pub fn forget(&self, handle: &JobHandle) -> Option<JobStatus> {
        self.observed
            .lock()
            .remove(handle.job_dir())
            .map(|o| o.report.status)
    }

    /// Queries the status and exit code of a job.
    pub async fn observe(&self, handle: &JobHandle) -> Result<SchedulerReport, MonitorError> {
        if let Some(observation) = self.observed.lock().get(handle.job_dir())
            && observation.report.status.is_terminal()
        {
            return Ok(observation.report);
        }

        let report = self.transport.status(handle).await?;
        debug!(
            job_id = handle.job_id(),
            status = %report.status,
            "polled job status"
        );

        let (report, changed, step) = {
            let mut observed = self.observed.lock();
            let previous = observed.get(handle.job_dir()).copied();
            let count = previous.map(|o| o.count).unwrap_or(0) + 1;

            let report = match previous {
                Some(previous) if report.status.stage() < previous.report.status.stage() => {
                    warn!(
                        job_id = handle.job_id(),
                        reported = %report.status,
                        last = %previous.report.status,
                        "ignoring stale job status"
                    );
                    previous.report
                }
                _ => report,
            };

            observed.insert(
                handle.job_dir().to_path_buf(),
                Observation { report, count },
            );
            let changed = previous.map(|o| o.report.status) != Some(report.status);
            (report, changed, count)
        };

        if changed {
            info!(
                job_id = handle.job_id(),
                job = handle.job_name(),
                status = %report.status,
                "job status changed"
            );
            self.track(handle, report.status, step).await;
        }

        Ok(report)
    }

    /// Queries the status of a job.
    pub async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, MonitorError> {
        Ok(self.observe(handle).await?.status)
    }

    /// Waits until the observed status of a job differs from the last one
    /// and returns it.
    ///
    /// Returns the current status at once if the job was never observed or
    /// is already terminal.
    pub async fn next_change(&self, handle: &JobHandle) -> Result<JobStatus, MonitorError> {
        let last = self.last_status(handle);
        if let Some(status) = last
            && status.is_terminal()
        {
            return Ok(status);
        }

        let mut failures = 0;
        loop {
            match self.observe(handle).await {
                Ok(report) if Some(report.status) != last => return Ok(report.status),
                Ok(_) => failures = 0,
                Err(e) => failures = self.tolerate(e, failures)?,
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Waits until a job reaches a terminal status.
    pub async fn wait(&self, handle: &JobHandle) -> Result<JobSummary, MonitorError> {
        let mut failures = 0;
        loop {
            match self.observe(handle).await {
                Ok(report) if report.status.is_terminal() => {
                    return Ok(JobSummary::new(handle, report.status, report.exit_code));
                }
                Ok(_) => failures = 0,
                Err(e) => failures = self.tolerate(e, failures)?,
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Streams the output of a job.
    ///
    /// Standard output and standard error are tailed from the start. Files
    /// that do not exist yet are waited for, and files that are truncated or
    /// replaced are read again from the start. Once the job is terminal the
    /// remaining output is drained, a [`LogEvent::Finished`] summary is
    /// produced and the stream ends. Streaming a terminal job again yields the
    /// same summary.
    pub fn stream_logs<'a>(
        &'a self,
        handle: &'a JobHandle,
    ) -> impl Stream<Item = Result<LogEvent, MonitorError>> + Send + 'a {
        let state = TailState {
            tails: [
                LogTail::new(handle.stdout(), LogStream::Stdout),
                LogTail::new(handle.stderr(), LogStream::Stderr),
            ],
            pending: VecDeque::new(),
            failures: 0,
            terminal: None,
            done: false,
        };

        stream::unfold(state, move |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }

                let read = state.read().await;
                if let Some(report) = state.terminal {
                    // Drain until the files stop yielding bytes.
                    match read {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(e) => warn!(
                            job_id = handle.job_id(),
                            "failed to drain job output: {e}"
                        ),
                    }
                    state.finish(handle, report);
                    continue;
                }

                match read {
                    Ok(true) => {
                        state.failures = 0;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => match self.tolerate(log_error(handle, &e), state.failures) {
                        Ok(failures) => state.failures = failures,
                        Err(e) => {
                            state.done = true;
                            return Some((Err(e), state));
                        }
                    },
                }

                match self.observe(handle).await {
                    Ok(report) if report.status.is_terminal() => {
                        state.failures = 0;
                        state.terminal = Some(report);
                        continue;
                    }
                    Ok(_) => state.failures = 0,
                    Err(e) => match self.tolerate(e, state.failures) {
                        Ok(failures) => state.failures = failures,
                        Err(e) => {
                            state.done = true;
                            return Some((Err(e), state));
                        }
                    },
                }

                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }

    /// Accounts for a failed poll.
    ///
    /// Returns the new count of consecutive failures, or the error to
    /// surface if the failure is fatal or the budget is exhausted.
    fn tolerate(&self, error: MonitorError, failures: u32) -> Result<u32, MonitorError> {
        let (job_id, message) = match error {
            MonitorError::Transient { job_id, message } => (job_id, message),
            error => return Err(error),
        };

        let failures = failures + 1;
        if failures >= self.max_failures {
            return Err(MonitorError::Exhausted {
                job_id,
                attempts: failures,
                last: message,
            });
        }

        warn!(
            %job_id,
            failures,
            "transient monitoring failure: {message}"
        );
        Ok(failures)
    }

    /// Notifies the trackers of a status change.
    async fn track(&self, handle: &JobHandle, status: JobStatus, step: u64) {
        if self.trackers.is_empty() {
            return;
        }

        let elapsed = (Utc::now() - handle.created_at()).num_milliseconds() as f64 / 1000.0;
        let mut values = IndexMap::new();
        values.insert(STATUS_STAGE_METRIC.to_string(), f64::from(status.stage()));
        values.insert(ELAPSED_SECONDS_METRIC.to_string(), elapsed.max(0.0));

        for tracker in &self.trackers {
            if let Err(e) = tracker.record(step, &values).await {
                warn!(
                    job_id = handle.job_id(),
                    ?tracker,
                    "failed to record tracking data: {e:#}"
                );
            }
        }
    }
}

/// Converts a log read failure into a transient monitoring error.
fn log_error(handle: &JobHandle, error: &io::Error) -> MonitorError {
    MonitorError::Transient {
        job_id: handle.job_id().to_string(),
        message: format!("failed to read job output: {error}"),
    }
}

/// The state of a log stream between items.
struct TailState {
    /// The standard output and standard error tails.
    tails: [LogTail; 2],
    /// Events read but not yet yielded.
    pending: VecDeque<LogEvent>,
    /// The number of consecutive failures.
    failures: u32,
    /// The terminal report, once observed; the output is being drained.
    terminal: Option<SchedulerReport>,
    /// Whether the final summary has been queued.
    done: bool,
}

impl TailState {
    /// Reads new output from both files.
    ///
    /// Returns whether any bytes were read.
    async fn read(&mut self) -> io::Result<bool> {
        let mut read = false;
        for tail in &mut self.tails {
            read |= tail.read(&mut self.pending).await?;
        }
        Ok(read)
    }

    /// Queues the unterminated last lines and the final summary.
    fn finish(&mut self, handle: &JobHandle, report: SchedulerReport) {
        for tail in &mut self.tails {
            tail.flush(&mut self.pending);
        }
        self.pending.push_back(LogEvent::Finished(JobSummary::new(
            handle,
            report.status,
            report.exit_code,
        )));
        self.done = true;
    }
}

/// The number of leading bytes compared to detect a rewritten file.
const HEAD_LEN: usize = 64;

/// The size of a single read from an output file.
const CHUNK_SIZE: usize = 64 * 1024;

/// The most bytes read from one output file per call.
const MAX_READ_BYTES: u64 = 1024 * 1024;

/// The longest unterminated line buffered before it is emitted as is.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// The device and inode numbers of a file.
type FileId = (u64, u64);

/// Gets the identity of a file.
#[cfg(unix)]
fn file_id(metadata: &std::fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt as _;

    Some((metadata.dev(), metadata.ino()))
}

/// Gets the identity of a file.
#[cfg(not(unix))]
fn file_id(_: &std::fs::Metadata) -> Option<FileId> {
    None
}

/// Follows one output file.
///
/// A file is read again from the start when it shrinks, when a different
/// file appears at its path, or when its first bytes change.
struct LogTail {
    /// The file.
    path: PathBuf,
    /// The stream the file holds.
    stream: LogStream,
    /// The number of bytes consumed.
    offset: u64,
    /// Bytes read after the last complete line.
    partial: Vec<u8>,
    /// The identity of the file last read.
    identity: Option<FileId>,
    /// The first bytes consumed, up to [`HEAD_LEN`].
    head: Vec<u8>,
}

impl LogTail {
    /// Creates a tail starting at the beginning of the file.
    fn new(path: PathBuf, stream: LogStream) -> Self {
        Self {
            path,
            stream,
            offset: 0,
            partial: Vec::new(),
            identity: None,
            head: Vec::new(),
        }
    }

    /// Reads the complete lines appended since the last read.
    ///
    /// At most [`MAX_READ_BYTES`] are read per call. Returns whether any bytes
    /// were read.
    async fn read(&mut self, events: &mut VecDeque<LogEvent>) -> io::Result<bool> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.offset > 0 {
                    self.restart("output file was removed", events);
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let metadata = file.metadata().await?;
        let identity = file_id(&metadata);
        if self.offset > 0 {
            let reason = if self.identity.is_some() && identity != self.identity {
                Some("output file was replaced")
            } else if metadata.len() < self.offset {
                Some("output file was truncated")
            } else if !self.head_matches(&mut file).await? {
                Some("output file was rewritten")
            } else {
                None
            };
            if let Some(reason) = reason {
                self.restart(reason, events);
            }
        }
        self.identity = identity;

        if metadata.len() <= self.offset {
            return Ok(false);
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0;
        while total < MAX_READ_BYTES {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.consume(&buf[..n], events);
            total += n as u64;
        }
        Ok(total > 0)
    }

    /// Queues an unterminated last line.
    fn flush(&mut self, events: &mut VecDeque<LogEvent>) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.emit(&line, events);
        }
    }

    /// Checks that the file still starts with the bytes consumed first.
    async fn head_matches(&self, file: &mut tokio::fs::File) -> io::Result<bool> {
        let mut head = vec![0u8; self.head.len()];
        file.seek(SeekFrom::Start(0)).await?;
        match file.read_exact(&mut head).await {
            Ok(_) => Ok(head == self.head),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Starts over at the beginning of the file.
    fn restart(&mut self, reason: &str, events: &mut VecDeque<LogEvent>) {
        debug!(path = %self.path.display(), "{reason}; reading from the start");
        self.flush(events);
        self.offset = 0;
        self.identity = None;
        self.head.clear();
    }

    /// Consumes bytes read at the current offset and queues complete lines.
    fn consume(&mut self, bytes: &[u8], events: &mut VecDeque<LogEvent>) {
        if self.head.len() < HEAD_LEN {
            let n = (HEAD_LEN - self.head.len()).min(bytes.len());
            self.head.extend_from_slice(&bytes[..n]);
        }
        self.offset += bytes.len() as u64;
        self.partial.extend_from_slice(bytes);

        let mut start = 0;
        while let Some(pos) = self.partial[start..].iter().position(|b| *b == b'\n') {
            self.emit(&self.partial[start..start + pos], events);
            start += pos + 1;
        }
        self.partial.drain(..start);

        if self.partial.len() >= MAX_LINE_BYTES {
            self.flush(events);
        }
    }

    /// Queues a line.
    fn emit(&self, line: &[u8], events: &mut VecDeque<LogEvent>) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        events.push_back(LogEvent::Line {
            stream: self.stream,
            line: String::from_utf8_lossy(line).into_owned(),
        });
    }
}
