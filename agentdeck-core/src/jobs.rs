//! Async job store
//!
//! Jobs are the fire-and-forget counterpart of runs for automation callers:
//! no window, no event log, just a process whose bounded output, exit status
//! and liveness are tracked in `jobs.json`.
//!
//! ## Job lifecycle
//!
//! ```text
//! running ──▶ finished | failed
//!    │
//!    └──▶ aborting ──▶ aborted
//!
//! (restored while running/aborting) ──▶ orphaned
//! ```

use crate::atomic;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::options::ExecutableRef;
use crate::paths::SharedDir;
use crate::process;
use crate::protocol::{AgentMessage, ItemPhase, ThreadItem};
use crate::snapshot::{DebouncedWriter, SnapshotSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

pub const JOBS_VERSION: u32 = 1;

/// Error recorded on jobs that were active when their store was reopened.
pub const ORPHANED_ERROR: &str = "orchestrator restarted while job was active";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Aborting,
    Finished,
    Failed,
    Aborted,
    Orphaned,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Aborting => "aborting",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
            JobStatus::Orphaned => "orphaned",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Aborting)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One job as persisted in `jobs.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub signal: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub window_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub last_output_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// The `jobs.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsFile {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
}

/// Optional links from a job to the rest of the world.
#[derive(Debug, Clone, Default)]
pub struct JobLink {
    pub window_id: Option<String>,
    pub task_id: Option<String>,
}

/// Broadcast when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub task_id: Option<String>,
    pub error: Option<String>,
    /// Text of the last completed assistant message, if any
    pub result_text: Option<String>,
}

struct JobEntry {
    record: JobRecord,
    last_message: Option<String>,
    cancel: Option<CancellationToken>,
    done: Option<watch::Receiver<bool>>,
}

struct JobInner {
    path: std::path::PathBuf,
    stdout_limit: usize,
    stderr_limit: usize,
    heartbeat: Duration,
    max_jobs: usize,
    grace: Duration,
    jobs: Mutex<HashMap<String, JobEntry>>,
    writer: Arc<DebouncedWriter>,
    events: broadcast::Sender<JobEvent>,
}

/// Handle to the job store of one data directory. Cheap to clone.
#[derive(Clone)]
pub struct JobStore {
    inner: Arc<JobInner>,
}

/// Append `line` to a bounded buffer, keeping the most recent bytes.
fn append_tail(buffer: &mut String, truncated: &mut bool, line: &str, limit: usize) {
    buffer.push_str(line);
    buffer.push('\n');
    if buffer.len() > limit {
        let mut cut = buffer.len() - limit;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
        *truncated = true;
    }
}

impl JobStore {
    /// Open the store in `dir`; jobs left active by a previous process
    /// become orphaned.
    pub fn open(dir: &SharedDir, config: &Config) -> Result<Self> {
        dir.ensure()?;
        let path = dir.jobs_path();
        let persisted: Option<JobsFile> = match atomic::read_json(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Job store unreadable, starting empty");
                None
            }
        };

        let now = Utc::now();
        let mut changed = false;
        let mut jobs = HashMap::new();
        for mut record in persisted.map(|f| f.jobs).unwrap_or_default() {
            if record.status.is_active() {
                tracing::info!(job_id = %record.id, "Marking job orphaned");
                record.status = JobStatus::Orphaned;
                record.error = Some(ORPHANED_ERROR.to_string());
                record.finished_at = Some(now);
                record.updated_at = now;
                record.pid = None;
                changed = true;
            }
            jobs.insert(
                record.id.clone(),
                JobEntry {
                    record,
                    last_message: None,
                    cancel: None,
                    done: None,
                },
            );
        }

        let (events, _) = broadcast::channel(64);
        let debounce = config.store.debounce();
        let inner = Arc::new_cyclic(|weak: &Weak<JobInner>| {
            let source: Weak<dyn SnapshotSource> = weak.clone();
            JobInner {
                writer: Arc::new(DebouncedWriter::new(path.clone(), debounce, source)),
                path,
                stdout_limit: config.jobs.stdout_limit,
                stderr_limit: config.jobs.stderr_limit,
                heartbeat: Duration::from_secs(config.jobs.heartbeat_secs.max(1)),
                max_jobs: config.jobs.max_jobs,
                grace: config.runs.abort_grace(),
                jobs: Mutex::new(jobs),
                events,
            }
        });

        if changed {
            inner.writer.flush();
        }
        tracing::debug!(path = %inner.path.display(), "Job store opened");
        Ok(Self { inner })
    }

    /// Spawn `exe` with `args`, optionally writing `input` to stdin, and
    /// return the job id immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_job(
        &self,
        exe: &ExecutableRef,
        args: &[String],
        input: Option<&str>,
        link: JobLink,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = JobRecord {
            id: id.clone(),
            status: JobStatus::Running,
            started_at: now,
            updated_at: now,
            finished_at: None,
            exit_code: None,
            signal: None,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            thread_id: None,
            window_id: link.window_id,
            task_id: link.task_id,
            args: args.to_vec(),
            pid: None,
            last_output_at: None,
            last_heartbeat_at: Some(now),
        };

        let mut child = match process::spawn(exe, args, None::<&Path>) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Failed to spawn job");
                self.inner.jobs().insert(
                    id.clone(),
                    JobEntry {
                        record,
                        last_message: None,
                        cancel: None,
                        done: None,
                    },
                );
                self.inner.finish(&id, JobStatus::Failed, None, None, Some(e.to_string()));
                return Ok(id);
            }
        };

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let mut record = record;
        record.pid = child.id();
        self.inner.jobs().insert(
            id.clone(),
            JobEntry {
                record,
                last_message: None,
                cancel: Some(cancel.clone()),
                done: Some(done_rx),
            },
        );
        self.inner.writer.schedule();

        match input {
            Some(input) => process::send_input(&mut child, input.to_string()),
            None => drop(child.stdin.take()),
        }

        tracing::info!(job_id = %id, program = %exe.program.display(), "Job started");
        let inner = Arc::clone(&self.inner);
        let job_id = id.clone();
        tokio::spawn(async move {
            drive(inner, job_id, child, cancel, done_tx).await;
        });
        Ok(id)
    }

    /// Request termination. Idempotent; does not wait for the process.
    pub fn cancel_job(&self, id: &str) -> Result<JobRecord> {
        let record = {
            let mut jobs = self.inner.jobs();
            let entry = jobs.get_mut(id).ok_or_else(|| Error::NotFound {
                kind: "job",
                id: id.to_string(),
            })?;
            if entry.record.status == JobStatus::Running {
                entry.record.status = JobStatus::Aborting;
                entry.record.updated_at = Utc::now();
                if let Some(cancel) = &entry.cancel {
                    cancel.cancel();
                }
                tracing::info!(job_id = %id, "Cancelling job");
            }
            entry.record.clone()
        };
        self.inner.writer.schedule();
        Ok(record)
    }

    pub fn get_job(&self, id: &str) -> Result<JobRecord> {
        self.inner
            .jobs()
            .get(id)
            .map(|e| e.record.clone())
            .ok_or_else(|| Error::NotFound {
                kind: "job",
                id: id.to_string(),
            })
    }

    /// The finished record, or [`Error::StillRunning`] while active.
    pub fn get_job_result(&self, id: &str) -> Result<JobRecord> {
        let record = self.get_job(id)?;
        if record.status.is_active() {
            return Err(Error::StillRunning {
                job_id: id.to_string(),
                status: record.status.to_string(),
            });
        }
        Ok(record)
    }

    /// All jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .inner
            .jobs()
            .values()
            .map(|e| e.record.clone())
            .collect();
        jobs.sort_by(|a, b| (a.started_at, &a.id).cmp(&(b.started_at, &b.id)));
        jobs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the job is no longer active, or `timeout` elapses.
    pub async fn wait_for_job(&self, id: &str, timeout: Duration) -> Result<JobRecord> {
        let done = {
            let jobs = self.inner.jobs();
            let entry = jobs.get(id).ok_or_else(|| Error::NotFound {
                kind: "job",
                id: id.to_string(),
            })?;
            entry.done.clone()
        };
        if let Some(mut done) = done {
            let _ = tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await;
        }
        self.get_job(id)
    }

    pub fn flush(&self) {
        self.inner.writer.flush();
    }

    /// Cancel active jobs, wait briefly for them and flush.
    pub async fn shutdown(&self) {
        let active: Vec<String> = self
            .inner
            .jobs()
            .values()
            .filter(|e| e.record.status.is_active())
            .map(|e| e.record.id.clone())
            .collect();
        for id in &active {
            let _ = self.cancel_job(id);
        }
        let wait = self.inner.grace + Duration::from_secs(2);
        for id in &active {
            let _ = self.wait_for_job(id, wait).await;
        }
        self.flush();
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl SnapshotSource for JobInner {
    fn render(&self) -> Result<Vec<u8>> {
        let mut jobs: Vec<JobRecord> = self.jobs().values().map(|e| e.record.clone()).collect();
        jobs.sort_by(|a, b| (a.started_at, &a.id).cmp(&(b.started_at, &b.id)));
        let file = JobsFile {
            version: JOBS_VERSION,
            updated_at: Utc::now(),
            jobs,
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl JobInner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(&self, id: &str, line: &str, stream: Stream) {
        {
            let mut jobs = self.jobs();
            let Some(entry) = jobs.get_mut(id) else {
                return;
            };
            let now = Utc::now();
            let record = &mut entry.record;
            record.last_output_at = Some(now);
            record.updated_at = now;
            match stream {
                Stream::Stdout => {
                    append_tail(
                        &mut record.stdout,
                        &mut record.stdout_truncated,
                        line,
                        self.stdout_limit,
                    );
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) {
                        match AgentMessage::classify(&value) {
                            AgentMessage::ThreadStarted { thread_id } => {
                                record.thread_id = Some(thread_id)
                            }
                            AgentMessage::Item {
                                phase: ItemPhase::Completed,
                                item: ThreadItem::AgentMessage { text, .. },
                            } => entry.last_message = Some(text),
                            _ => {}
                        }
                    }
                }
                Stream::Stderr => append_tail(
                    &mut record.stderr,
                    &mut record.stderr_truncated,
                    line,
                    self.stderr_limit,
                ),
            }
        }
        self.writer.schedule();
    }

    fn beat(&self, id: &str) {
        {
            let mut jobs = self.jobs();
            let Some(entry) = jobs.get_mut(id) else {
                return;
            };
            if !entry.record.status.is_active() {
                return;
            }
            entry.record.last_heartbeat_at = Some(Utc::now());
        }
        self.writer.schedule();
    }

    fn finish(
        &self,
        id: &str,
        status: JobStatus,
        exit_code: Option<i32>,
        signal: Option<i32>,
        error: Option<String>,
    ) {
        let event = {
            let mut jobs = self.jobs();
            let Some(entry) = jobs.get_mut(id) else {
                return;
            };
            let now = Utc::now();
            let record = &mut entry.record;
            record.status = status;
            record.exit_code = exit_code;
            record.signal = signal;
            record.error = error;
            record.finished_at = Some(now);
            record.updated_at = now;
            record.pid = None;
            entry.cancel = None;

            tracing::info!(
                job_id = %id,
                status = %status,
                exit_code = ?exit_code,
                signal = ?signal,
                "Job finished"
            );
            let event = JobEvent {
                job_id: id.to_string(),
                status,
                task_id: record.task_id.clone(),
                error: record.error.clone(),
                result_text: entry.last_message.clone(),
            };
            prune(&mut jobs, self.max_jobs);
            event
        };
        let _ = self.events.send(event);
        self.writer.schedule();
    }
}

/// Forget the oldest finished jobs while over `max_jobs`.
fn prune(jobs: &mut HashMap<String, JobEntry>, max_jobs: usize) {
    if jobs.len() <= max_jobs {
        return;
    }
    let mut finished: Vec<(DateTime<Utc>, String)> = jobs
        .values()
        .filter(|e| !e.record.status.is_active())
        .map(|e| {
            (
                e.record.finished_at.unwrap_or(e.record.started_at),
                e.record.id.clone(),
            )
        })
        .collect();
    finished.sort();
    let excess = jobs.len() - max_jobs;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

async fn drive(
    inner: Arc<JobInner>,
    id: String,
    mut child: Child,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
) {
    let readers: Vec<_> = [
        child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_lines(Arc::clone(&inner), id.clone(), s, Stream::Stdout))),
        child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_lines(Arc::clone(&inner), id.clone(), s, Stream::Stderr))),
    ]
    .into_iter()
    .flatten()
    .collect();

    let stop_heartbeat = CancellationToken::new();
    let heartbeat = {
        let inner = Arc::clone(&inner);
        let id = id.clone();
        let stop = stop_heartbeat.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => inner.beat(&id),
                }
            }
        })
    };

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => process::terminate(&mut child, inner.grace).await,
    };

    for mut reader in readers {
        if tokio::time::timeout(Duration::from_secs(2), &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }
    stop_heartbeat.cancel();
    let _ = heartbeat.await;

    match status {
        Ok(status) => {
            let (code, signal) = process::exit_parts(&status);
            if cancel.is_cancelled() {
                inner.finish(&id, JobStatus::Aborted, code, signal, Some("job cancelled".into()));
            } else if status.success() {
                inner.finish(&id, JobStatus::Finished, code, signal, None);
            } else {
                let message = process::describe_failure(&status);
                inner.finish(&id, JobStatus::Failed, code, signal, message);
            }
        }
        Err(e) => inner.finish(
            &id,
            JobStatus::Failed,
            None,
            None,
            Some(format!("failed waiting for job: {e}")),
        ),
    }
    let _ = done.send(true);
}

async fn read_lines<R>(inner: Arc<JobInner>, id: String, stream: R, kind: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => inner.append(&id, &line, kind),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(job_id = %id, error = %e, "Job output stream failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_tail_keeps_recent_output() {
        let mut buffer = String::new();
        let mut truncated = false;
        append_tail(&mut buffer, &mut truncated, "first", 12);
        assert!(!truncated);
        append_tail(&mut buffer, &mut truncated, "second", 12);
        assert!(truncated);
        assert_eq!(buffer, "irst\nsecond\n");
        assert!(buffer.len() <= 12);
    }

    #[test]
    fn test_append_tail_cuts_on_char_boundary() {
        let mut buffer = String::new();
        let mut truncated = false;
        append_tail(&mut buffer, &mut truncated, "ééééé", 6);
        assert!(truncated);
        assert!(buffer.len() <= 6);
        assert!(buffer.ends_with('\n'));
    }

    #[test]
    fn test_restored_active_jobs_are_orphaned() {
        let dir = tempfile::TempDir::new().unwrap();
        let shared = SharedDir::new(dir.path());
        let now = Utc::now();
        let record = |id: &str, status| JobRecord {
            id: id.into(),
            status,
            started_at: now,
            updated_at: now,
            finished_at: None,
            exit_code: None,
            signal: None,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            thread_id: None,
            window_id: None,
            task_id: None,
            args: vec![],
            pid: Some(1),
            last_output_at: None,
            last_heartbeat_at: None,
        };
        let file = JobsFile {
            version: JOBS_VERSION,
            updated_at: now,
            jobs: vec![
                record("a", JobStatus::Running),
                record("b", JobStatus::Finished),
            ],
        };
        atomic::write_json(&shared.jobs_path(), &file).unwrap();

        let store = JobStore::open(&shared, &Config::default()).unwrap();
        let a = store.get_job("a").unwrap();
        assert_eq!(a.status, JobStatus::Orphaned);
        assert_eq!(a.pid, None);
        assert_eq!(store.get_job("b").unwrap().status, JobStatus::Finished);

        let on_disk: JobsFile = atomic::read_json(&shared.jobs_path()).unwrap().unwrap();
        assert!(on_disk.jobs.iter().all(|j| !j.status.is_active()));
    }
}
