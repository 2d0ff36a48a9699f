//! Run engine: spawn the agent, stream its output into events, classify exit.
//!
//! Each run gets three tasks: a driver that owns the child and waits for it
//! (or terminates it on abort), and one line reader per output stream.

use super::{ActiveRun, Inner, Orchestrator, RunState};
use crate::error::{Error, Result};
use crate::event::{ClippedText, EventBuffer, EventKind};
use crate::options::{build_exec_args, ExecutableRef, RunOptions};
use crate::process;
use crate::protocol::{AgentMessage, ItemPhase, ThreadItem};
use crate::tasks::{TaskBinding, TaskOutcome, TaskStatus};
use crate::types::{Run, RunStatus, WindowStatus};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How long readers may keep draining after the process has exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const ABORTED_ERROR: &str = "run aborted";

/// Bytes of a stderr/raw line copied into the window transcript.
const NOTE_LIMIT: usize = 512;

/// Terminal classification of a run.
#[derive(Debug, Clone)]
struct Outcome {
    status: RunStatus,
    error: Option<String>,
    exit_code: Option<i32>,
}

impl Outcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error.into()),
            exit_code: None,
        }
    }
}

/// Where a run request came from, for idempotency and task binding.
#[derive(Debug, Clone, Default)]
pub(crate) struct LaunchOrigin {
    pub request_id: Option<String>,
    pub task_id: Option<String>,
}

fn task_status(status: RunStatus) -> TaskStatus {
    match status {
        RunStatus::Completed => TaskStatus::Completed,
        RunStatus::Aborted => TaskStatus::Aborted,
        _ => TaskStatus::Failed,
    }
}

impl Orchestrator {
    /// Start a run of `exe` on an idle window and return its id.
    ///
    /// Must be called from within a tokio runtime; outside one this fails
    /// with [`Error::Spawn`] and leaves the window untouched. A spawn
    /// failure still returns the run id; that run is already `failed`.
    pub fn start_run(
        &self,
        window_id: &str,
        input: &str,
        exe: &ExecutableRef,
        overrides: &RunOptions,
    ) -> Result<String> {
        self.launch(window_id, input, exe, overrides, LaunchOrigin::default())
    }

    pub(crate) fn launch(
        &self,
        window_id: &str,
        input: &str,
        exe: &ExecutableRef,
        overrides: &RunOptions,
        origin: LaunchOrigin,
    ) -> Result<String> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::Spawn(
                "no tokio runtime to drive the agent process".to_string(),
            ));
        }

        let now = Utc::now();
        let (run_id, options, thread_id, cancel, done_tx) = {
            let mut world = self.inner.world();
            let window = world
                .windows
                .get_mut(window_id)
                .ok_or_else(|| Error::window_not_found(window_id))?;
            if window.status.is_active() {
                return Err(Error::AlreadyRunning {
                    window_id: window_id.to_string(),
                    status: window.status.to_string(),
                });
            }

            let options = window.default_run_options.merge(overrides);
            let run_id = uuid::Uuid::new_v4().to_string();
            window.status = WindowStatus::Running;
            window.active_run_id = run_id.clone();
            window.last_run_options = Some(options.clone());
            window.last_run_at = Some(now);
            window.updated_at = now;
            let thread_id = window.thread_id.clone();

            let run = Run {
                id: run_id.clone(),
                window_id: window_id.to_string(),
                status: RunStatus::Running,
                started_at: now,
                finished_at: None,
                options: options.clone(),
                thread_id: thread_id.clone(),
                next_seq: 0,
                dropped_events: 0,
                error: None,
                exit_code: None,
                pid: None,
                request_id: origin.request_id,
                todo_list: vec![],
            };
            let mut state = RunState::new(run, EventBuffer::new(world.limits.max_events));
            state.emit(EventKind::status(RunStatus::Running.as_str(), None));
            world.runs.insert(run_id.clone(), state);

            let history_limit = world.limits.input_history;
            world
                .inputs
                .entry(window_id.to_string())
                .or_default()
                .record(input, history_limit);
            world.note(window_id, format!("> {}", input.trim()));

            if let Some(task_id) = &origin.task_id {
                if let Err(e) = world
                    .tasks
                    .mark_running(task_id, TaskBinding::Run(run_id.clone()))
                {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to bind task to run");
                }
            }

            let cancel = CancellationToken::new();
            let (done_tx, done_rx) = watch::channel(false);
            world.active.insert(
                run_id.clone(),
                ActiveRun {
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
            (run_id, options, thread_id, cancel, done_tx)
        };
        self.inner.schedule_save();

        let args = build_exec_args(&options, Some(&thread_id));
        let cwd = options
            .working_directory
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(Path::new);

        tracing::info!(
            run_id = %run_id,
            window_id = %window_id,
            program = %exe.program.display(),
            resume = !thread_id.is_empty(),
            "Starting run"
        );

        let mut child = match process::spawn(exe, &args, cwd) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to spawn agent");
                self.inner.finish_run(&run_id, Outcome::failed(e.to_string()));
                drop(done_tx);
                return Ok(run_id);
            }
        };

        {
            let mut world = self.inner.world();
            if let Some(state) = world.runs.get_mut(&run_id) {
                state.run.pid = child.id();
            }
        }
        process::send_input(&mut child, input.to_string());

        let inner = Arc::clone(&self.inner);
        let driver_run_id = run_id.clone();
        tokio::spawn(async move {
            drive(inner, driver_run_id, child, cancel, done_tx).await;
        });

        Ok(run_id)
    }

    /// Abort a run, given its id or its window's id.
    ///
    /// Idempotent; returns once termination has been requested, without
    /// waiting for the process to die.
    pub fn abort_run(&self, id: &str) -> Result<()> {
        {
            let mut world = self.inner.world();
            let run_id = if world.runs.contains_key(id) {
                id.to_string()
            } else if let Some(window) = world.windows.get(id) {
                if window.active_run_id.is_empty() {
                    return Ok(());
                }
                window.active_run_id.clone()
            } else {
                return Err(Error::NotFound {
                    kind: "run or window",
                    id: id.to_string(),
                });
            };

            let Some(state) = world.runs.get_mut(&run_id) else {
                return Ok(());
            };
            if state.run.status != RunStatus::Running {
                return Ok(());
            }
            state.run.status = RunStatus::Aborting;
            state.emit(EventKind::status(RunStatus::Aborting.as_str(), None));
            let window_id = state.run.window_id.clone();

            if let Some(window) = world.windows.get_mut(&window_id) {
                if window.active_run_id == run_id {
                    window.status = WindowStatus::Aborting;
                    window.updated_at = Utc::now();
                }
            }
            if let Some(active) = world.active.get(&run_id) {
                active.cancel.cancel();
            }
            world.note(&window_id, "[aborting]");
            tracing::info!(run_id = %run_id, window_id = %window_id, "Aborting run");
        }
        self.inner.schedule_save();
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        self.inner
            .world()
            .runs
            .get(run_id)
            .map(|s| s.run.clone())
            .ok_or_else(|| Error::run_not_found(run_id))
    }

    /// Runs of a window, oldest first.
    pub fn list_runs(&self, window_id: &str) -> Result<Vec<Run>> {
        let world = self.inner.world();
        if !world.windows.contains_key(window_id) {
            return Err(Error::window_not_found(window_id));
        }
        let mut runs: Vec<Run> = world
            .runs
            .values()
            .filter(|s| s.run.window_id == window_id)
            .map(|s| s.run.clone())
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }
}

/// Own the child until it exits, then classify and record the outcome.
async fn drive(
    inner: Arc<Inner>,
    run_id: String,
    mut child: Child,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
) {
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_lines(Arc::clone(&inner), run_id.clone(), out, Stream::Stdout)));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_lines(Arc::clone(&inner), run_id.clone(), err, Stream::Stderr)));

    let grace = inner.config.runs.abort_grace();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => process::terminate(&mut child, grace).await,
    };

    let mut plumbing_error = None;
    for mut reader in [stdout, stderr].into_iter().flatten() {
        match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => plumbing_error = Some(format!("failed to read agent output: {e}")),
            Ok(Err(e)) => plumbing_error = Some(format!("output reader crashed: {e}")),
            Err(_) => {
                // A grandchild still holds the pipe open
                reader.abort();
            }
        }
    }

    let outcome = if cancel.is_cancelled() {
        Outcome {
            status: RunStatus::Aborted,
            error: Some(ABORTED_ERROR.to_string()),
            exit_code: status.as_ref().ok().and_then(|s| s.code()),
        }
    } else {
        match status {
            Err(e) => Outcome::failed(format!("failed waiting for agent: {e}")),
            Ok(_) if plumbing_error.is_some() => {
                Outcome::failed(plumbing_error.unwrap_or_default())
            }
            Ok(status) => match process::describe_failure(&status) {
                None => Outcome {
                    status: RunStatus::Completed,
                    error: None,
                    exit_code: status.code(),
                },
                Some(message) => Outcome {
                    status: RunStatus::Failed,
                    error: Some(message),
                    exit_code: status.code(),
                },
            },
        }
    };

    inner.finish_run(&run_id, outcome);
    let _ = done.send(true);
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn read_lines<R>(
    inner: Arc<Inner>,
    run_id: String,
    stream: R,
    kind: Stream,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        match kind {
            Stream::Stdout => inner.handle_stdout(&run_id, &line),
            Stream::Stderr => inner.handle_stderr(&run_id, &line),
        }
    }
    Ok(())
}

impl Inner {
    fn handle_stdout(&self, run_id: &str, line: &str) {
        let trimmed = line.trim();
        // Blank lines are line-protocol separators, not agent output
        if trimmed.is_empty() {
            return;
        }

        {
            let mut guard = self.world();
            let world = &mut *guard;
            let text_limit = world.limits.event_text_limit;
            let Some(state) = world.runs.get_mut(run_id) else {
                return;
            };
            let window_id = state.run.window_id.clone();

            let note = match serde_json::from_str::<serde_json::Value>(trimmed) {
                Err(e) => {
                    state.emit(EventKind::Raw {
                        text: ClippedText::new(line, text_limit),
                        error: e.to_string(),
                    });
                    Some(format!("[raw] {}", ClippedText::new(line, NOTE_LIMIT).text))
                }
                Ok(value) => {
                    let message = AgentMessage::classify(&value);
                    state.emit(EventKind::Stdout { payload: value });

                    match message {
                        AgentMessage::ThreadStarted { thread_id } => {
                            state.run.thread_id = thread_id.clone();
                            if let Some(window) = world.windows.get_mut(&window_id) {
                                window.thread_id = thread_id.clone();
                                window.updated_at = Utc::now();
                            }
                            tracing::debug!(run_id, thread_id = %thread_id, "Thread announced");
                            Some(format!("[thread {thread_id}]"))
                        }
                        AgentMessage::Item {
                            item: ThreadItem::TodoList { id, items },
                            ..
                        } => {
                            let now = Utc::now();
                            state.run.todo_list = items.clone();
                            if let Some(window) = world.windows.get_mut(&window_id) {
                                window.todo_list = items;
                                window.todo_list_id = id;
                                window.todo_list_updated_at = Some(now);
                                window.updated_at = now;
                            }
                            None
                        }
                        AgentMessage::Item {
                            phase: ItemPhase::Completed,
                            item: ThreadItem::AgentMessage { text, .. },
                        } => {
                            state.last_message = Some(text.clone());
                            Some(text)
                        }
                        AgentMessage::TurnFailed { message } => {
                            let message = message.unwrap_or_else(|| "turn failed".to_string());
                            state.last_error = Some(message.clone());
                            Some(format!("[turn failed] {message}"))
                        }
                        AgentMessage::Error { message } => {
                            state.last_error = Some(message.clone());
                            Some(format!("[error] {message}"))
                        }
                        _ => None,
                    }
                }
            };

            if let Some(note) = note {
                world.note(&window_id, note);
            }
        }
        self.schedule_save();
    }

    fn handle_stderr(&self, run_id: &str, line: &str) {
        {
            let mut world = self.world();
            let text_limit = world.limits.event_text_limit;
            let Some(state) = world.runs.get_mut(run_id) else {
                return;
            };
            state.emit(EventKind::Stderr {
                text: ClippedText::new(line, text_limit),
            });
            let window_id = state.run.window_id.clone();
            let clipped = ClippedText::new(line, NOTE_LIMIT).text;
            world.note(&window_id, format!("[stderr] {clipped}"));
        }
        self.schedule_save();
    }

    /// Record the terminal state of a run, release its window and finish
    /// any task bound to it.
    fn finish_run(&self, run_id: &str, outcome: Outcome) {
        let notifications = {
            let mut guard = self.world();
            let world = &mut *guard;
            world.active.remove(run_id);
            let Some(state) = world.runs.get_mut(run_id) else {
                return;
            };
            if state.run.status.is_terminal() {
                return;
            }

            let error = match (&outcome.error, &state.last_error) {
                (Some(error), Some(reported)) if outcome.status == RunStatus::Failed => {
                    Some(format!("{error}: {reported}"))
                }
                (error, _) => error.clone(),
            };

            state.emit(EventKind::status(outcome.status.as_str(), error.clone()));
            state.run.status = outcome.status;
            state.run.error = error.clone();
            state.run.exit_code = outcome.exit_code;
            state.run.finished_at = Some(Utc::now());
            state.run.pid = None;
            let window_id = state.run.window_id.clone();
            let result_text = state.last_message.clone();

            if let Some(window) = world.windows.get_mut(&window_id) {
                if window.active_run_id == run_id {
                    window.release();
                }
            }
            let line = match &error {
                Some(error) => format!("[{}] {error}", outcome.status),
                None => format!("[{}]", outcome.status),
            };
            world.note(&window_id, line);
            world.prune_runs(&window_id);

            tracing::info!(
                run_id,
                window_id = %window_id,
                status = %outcome.status,
                exit_code = ?outcome.exit_code,
                error = ?error,
                "Run finished"
            );

            world.tasks.finish_bound(
                &TaskBinding::Run(run_id.to_string()),
                &TaskOutcome {
                    status: task_status(outcome.status),
                    error,
                    result_text,
                },
            )
        };
        self.notify(notifications);
        self.schedule_save();
    }
}
