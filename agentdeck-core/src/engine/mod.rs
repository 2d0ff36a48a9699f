//! The orchestrator: windows, runs, event logs and tasks of one data directory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   start/abort/poll   ┌───────────────────────────┐
//! │  frontends   │ ───────────────────▶ │        Orchestrator       │
//! └──────────────┘                      │  Mutex<World>             │
//! ┌──────────────┐   requests.json      │   windows, runs+events,   │
//! │  producers   │ ───────────────────▶ │   transcripts, inputs,    │
//! └──────────────┘   (reconcile)        │   tasks, active handles   │
//!                                       └─────────────┬─────────────┘
//!                      per-run driver tasks ◀─────────┤ debounced
//!                      (stdout/stderr readers)        ▼
//!                                               state.json
//! ```
//!
//! All state lives in one [`World`] behind a `std::sync::Mutex` that is never
//! held across an `.await`. Event emission for a run takes that lock, so the
//! order of `seq` equals the order of emission.

pub mod poll;
mod reconcile;
mod registry;
mod runner;
mod tasks;

pub use reconcile::ReconcileReport;
pub use registry::NewWindow;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{EventBuffer, EventKind, RunEvent};
use crate::options::ExecutableRef;
use crate::paths::SharedDir;
use crate::queue::RequestQueue;
use crate::snapshot::{
    self, DebouncedWriter, SnapshotSource, StateSnapshot, WindowLog, WindowTodo, SNAPSHOT_VERSION,
};
use crate::tasks::{TaskBinding, TaskNotification, TaskOutcome, TaskStatus, TaskTable};
use crate::types::{InputHistory, Run, RunStatus, Transcript, Window};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Error recorded on runs that were active when their orchestrator went away.
pub const RESTART_ERROR: &str = "orchestrator restarted while run was active";

/// Extra time allowed past the abort grace for a run to report its exit.
const EXIT_MARGIN: Duration = Duration::from_secs(2);

/// Handle to a running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) dir: SharedDir,
    pub(crate) config: Config,
    pub(crate) executable: ExecutableRef,
    pub(crate) queue: RequestQueue,
    world: Mutex<World>,
    writer: Arc<DebouncedWriter>,
    task_events: broadcast::Sender<TaskNotification>,
}

/// Limits copied out of [`Config`] for use under the world lock.
#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub max_events: usize,
    pub event_text_limit: usize,
    pub input_history: usize,
    pub transcript_lines: usize,
    pub window_log_events: usize,
    pub finished_runs_per_window: usize,
}

impl Limits {
    fn from_config(config: &Config) -> Self {
        Self {
            max_events: config.runs.max_events,
            event_text_limit: config.runs.event_text_limit,
            input_history: config.runs.input_history_limit,
            transcript_lines: config.store.window_log_lines,
            window_log_events: config.store.window_log_events,
            finished_runs_per_window: config.runs.finished_runs_per_window,
        }
    }
}

/// Everything the orchestrator owns.
pub(crate) struct World {
    pub limits: Limits,
    pub windows: HashMap<String, Window>,
    pub runs: HashMap<String, RunState>,
    pub transcripts: HashMap<String, Transcript>,
    pub inputs: HashMap<String, InputHistory>,
    pub tasks: TaskTable,
    /// Live process handles, keyed by run id
    pub active: HashMap<String, ActiveRun>,
}

/// A run plus its event buffer.
pub(crate) struct RunState {
    pub run: Run,
    pub events: EventBuffer,
    /// Text of the last completed assistant message
    pub last_message: Option<String>,
    /// Last error the agent itself reported
    pub last_error: Option<String>,
}

impl RunState {
    fn new(run: Run, events: EventBuffer) -> Self {
        Self {
            run,
            events,
            last_message: None,
            last_error: None,
        }
    }

    pub fn emit(&mut self, kind: EventKind) -> RunEvent {
        let event = self.events.push(&self.run.id, kind);
        self.run.next_seq = self.events.next_seq();
        self.run.dropped_events = self.events.dropped();
        event
    }
}

pub(crate) struct ActiveRun {
    pub cancel: CancellationToken,
    pub done: watch::Receiver<bool>,
}

impl World {
    fn new(limits: Limits, tasks: TaskTable) -> Self {
        Self {
            limits,
            windows: HashMap::new(),
            runs: HashMap::new(),
            transcripts: HashMap::new(),
            inputs: HashMap::new(),
            tasks,
            active: HashMap::new(),
        }
    }

    /// Append a transcript line to a window.
    pub fn note(&mut self, window_id: &str, line: impl Into<String>) {
        let limit = self.limits.transcript_lines;
        self.transcripts
            .entry(window_id.to_string())
            .or_default()
            .push(line.into(), limit);
    }

    /// Forget the oldest finished runs of a window beyond the retention limit.
    pub fn prune_runs(&mut self, window_id: &str) {
        let mut finished: Vec<(chrono::DateTime<Utc>, String)> = self
            .runs
            .values()
            .filter(|s| s.run.window_id == window_id && s.run.status.is_terminal())
            .map(|s| (s.run.started_at, s.run.id.clone()))
            .collect();
        let keep = self.limits.finished_runs_per_window.max(1);
        if finished.len() <= keep {
            return;
        }
        finished.sort();
        for (_, id) in finished.iter().take(finished.len() - keep) {
            self.runs.remove(id);
        }
    }

    /// Rebuild a world from a persisted snapshot.
    ///
    /// Returns the world and whether anything had to be reconciled: windows
    /// left active go back to idle and runs left active become failed, since
    /// their processes died with the previous owner.
    fn restore(mut snapshot: StateSnapshot, limits: Limits, tasks: TaskTable) -> (Self, bool) {
        let mut world = World::new(limits, tasks);
        let mut changed = false;
        let now = Utc::now();

        let mut persisted: HashMap<String, Vec<RunEvent>> = HashMap::new();
        let logs = std::mem::take(&mut snapshot.window_logs);
        for (window_id, log) in logs {
            for event in log.events {
                if !event.kind.is_gap() {
                    persisted.entry(event.run_id.clone()).or_default().push(event);
                }
            }
            world.transcripts.insert(
                window_id,
                Transcript {
                    lines: log.lines,
                    updated_at: log.updated_at,
                },
            );
        }

        for mut window in snapshot.windows {
            if window.status.is_active() || !window.active_run_id.is_empty() {
                tracing::info!(
                    window_id = %window.id,
                    status = %window.status,
                    "Releasing window left active by a previous process"
                );
                window.release();
                changed = true;
            }
            if window.todo_list.is_empty() {
                if let Some(todo) = snapshot.window_tasks.get(&window.id) {
                    window.todo_list = todo.todo_list.clone();
                    window.todo_list_id = todo.todo_list_id.clone();
                    window.todo_list_updated_at = todo.updated_at;
                }
            }
            world.windows.insert(window.id.clone(), window);
        }

        let mut orphaned = vec![];
        for run in snapshot.runs {
            let events = persisted.remove(&run.id).unwrap_or_default();
            let buffer = EventBuffer::restore(world.limits.max_events, events, run.next_seq);
            let mut state = RunState::new(run, buffer);
            state.run.next_seq = state.events.next_seq();
            state.run.dropped_events = state.events.dropped();
            state.run.pid = None;

            if !state.run.status.is_terminal() {
                tracing::info!(run_id = %state.run.id, "Marking orphaned run as failed");
                state.run.status = RunStatus::Failed;
                state.run.error = Some(RESTART_ERROR.to_string());
                state.run.finished_at = Some(now);
                state.emit(EventKind::status(
                    RunStatus::Failed.as_str(),
                    Some(RESTART_ERROR.to_string()),
                ));
                orphaned.push(state.run.id.clone());
                changed = true;
            }
            world.runs.insert(state.run.id.clone(), state);
        }

        world.inputs = snapshot.window_inputs.into_iter().collect();
        world.transcripts.retain(|id, _| world.windows.contains_key(id));
        world.tasks.restore(snapshot.mcp_tasks);

        let failed = TaskOutcome {
            status: TaskStatus::Failed,
            error: Some(RESTART_ERROR.to_string()),
            result_text: None,
        };
        for run_id in orphaned {
            world
                .tasks
                .finish_bound(&TaskBinding::Run(run_id), &failed);
        }

        (world, changed)
    }

    /// Render the persisted document.
    fn to_snapshot(&self) -> StateSnapshot {
        let mut windows: Vec<Window> = self.windows.values().cloned().collect();
        windows.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut runs: Vec<&RunState> = self.runs.values().collect();
        runs.sort_by(|a, b| (a.run.started_at, &a.run.id).cmp(&(b.run.started_at, &b.run.id)));

        let mut window_logs = BTreeMap::new();
        let mut window_tasks = BTreeMap::new();
        for window in &windows {
            let window_runs: Vec<&RunState> = runs
                .iter()
                .copied()
                .filter(|s| s.run.window_id == window.id)
                .collect();
            let transcript = self.transcripts.get(&window.id);
            window_logs.insert(
                window.id.clone(),
                WindowLog {
                    events: window_log_events(&window_runs, self.limits.window_log_events),
                    lines: transcript.map(|t| t.lines.clone()).unwrap_or_default(),
                    updated_at: transcript.and_then(|t| t.updated_at),
                },
            );
            if !window.todo_list.is_empty() || window.todo_list_id.is_some() {
                window_tasks.insert(
                    window.id.clone(),
                    WindowTodo {
                        todo_list: window.todo_list.clone(),
                        todo_list_id: window.todo_list_id.clone(),
                        updated_at: window.todo_list_updated_at,
                    },
                );
            }
        }

        StateSnapshot {
            version: SNAPSHOT_VERSION,
            updated_at: Utc::now(),
            runs: runs.iter().map(|s| s.run.clone()).collect(),
            windows,
            window_logs,
            window_tasks,
            window_inputs: self
                .inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            mcp_tasks: self.tasks.list().to_vec(),
        }
    }
}

/// The most recent `cap` events across a window's runs (oldest run first).
///
/// Each run whose persisted events do not start at seq 0 is preceded by a
/// gap marker naming the missing prefix.
fn window_log_events(runs: &[&RunState], cap: usize) -> Vec<RunEvent> {
    let mut remaining = cap;
    let mut chunks = vec![];
    for state in runs.iter().rev() {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(state.events.len());
        remaining -= take;

        let tail: Vec<RunEvent> = state.events.tail(take).cloned().collect();
        let from = tail
            .first()
            .map(|e| e.seq)
            .unwrap_or_else(|| state.events.next_seq());
        let mut chunk = Vec::with_capacity(tail.len() + 1);
        if from > 0 {
            chunk.push(RunEvent {
                seq: 0,
                ts: tail.first().map(|e| e.ts).unwrap_or_else(Utc::now),
                run_id: state.run.id.clone(),
                kind: EventKind::Gap { from: 0, to: from },
            });
        }
        chunk.extend(tail);
        chunks.push(chunk);
    }
    chunks.into_iter().rev().flatten().collect()
}

impl SnapshotSource for Inner {
    fn render(&self) -> Result<Vec<u8>> {
        let snapshot = self.world().to_snapshot();
        Ok(serde_json::to_vec_pretty(&snapshot)?)
    }
}

impl Inner {
    pub(crate) fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn schedule_save(&self) {
        self.writer.schedule();
    }

    pub(crate) fn notify(&self, notifications: Vec<TaskNotification>) {
        for notification in notifications {
            tracing::info!(
                task_id = %notification.task_id,
                status = %notification.status,
                "Task finished"
            );
            // No receivers is fine
            let _ = self.task_events.send(notification);
        }
    }
}

impl Orchestrator {
    /// Open the orchestrator for `dir`, restoring any persisted state.
    pub fn open(dir: SharedDir, config: Config) -> Result<Self> {
        config.validate()?;
        dir.ensure()?;

        let snapshot = match snapshot::read_snapshot(&dir) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let path = dir.state_path();
                let aside = path.with_extension(format!("corrupt-{}", Utc::now().timestamp()));
                match std::fs::rename(&path, &aside) {
                    Ok(()) => tracing::warn!(
                        path = %path.display(),
                        aside = %aside.display(),
                        error = %e,
                        "Snapshot unreadable, starting empty and keeping a copy"
                    ),
                    Err(rename_error) => tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        rename_error = %rename_error,
                        "Snapshot unreadable, starting empty; moving it aside failed"
                    ),
                }
                None
            }
        };

        let limits = Limits::from_config(&config);
        let tasks = TaskTable::new(&config.tasks);
        let (world, changed) = match snapshot {
            Some(snapshot) => World::restore(snapshot, limits, tasks),
            None => (World::new(limits, tasks), false),
        };

        let executable = ExecutableRef::from_config(&config.agent);
        let (task_events, _) = broadcast::channel(64);
        let state_path = dir.state_path();
        let debounce = config.store.debounce();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let source: Weak<dyn SnapshotSource> = weak.clone();
            Inner {
                queue: RequestQueue::new(&dir),
                dir,
                config,
                executable,
                world: Mutex::new(world),
                writer: Arc::new(DebouncedWriter::new(state_path, debounce, source)),
                task_events,
            }
        });

        {
            let world = inner.world();
            tracing::info!(
                dir = %inner.dir.root().display(),
                windows = world.windows.len(),
                runs = world.runs.len(),
                tasks = world.tasks.list().len(),
                "Orchestrator opened"
            );
        }

        if changed {
            inner.writer.flush();
        }

        Ok(Self { inner })
    }

    pub fn dir(&self) -> &SharedDir {
        &self.inner.dir
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The executable configured in `[agent]`.
    pub fn executable(&self) -> &ExecutableRef {
        &self.inner.executable
    }

    /// Current state as it would be persisted.
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.world().to_snapshot()
    }

    /// Write the snapshot now instead of waiting for the debounce.
    pub fn flush(&self) {
        self.inner.writer.flush();
    }

    /// Receive a notification whenever a task reaches a terminal state.
    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskNotification> {
        self.inner.task_events.subscribe()
    }

    /// Ids of runs that currently hold a process.
    pub fn active_runs(&self) -> Vec<String> {
        let world = self.inner.world();
        let mut ids: Vec<String> = world.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wait until `run_id` has exited, or `timeout` elapses, and return it.
    pub async fn wait_for_run(&self, run_id: &str, timeout: Duration) -> Result<Run> {
        let done = {
            let world = self.inner.world();
            if !world.runs.contains_key(run_id) {
                return Err(Error::run_not_found(run_id));
            }
            world.active.get(run_id).map(|active| active.done.clone())
        };
        if let Some(mut done) = done {
            let _ = tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await;
        }
        self.get_run(run_id)
    }

    /// Abort every active run, wait briefly for them to exit and flush.
    pub async fn shutdown(&self) -> usize {
        let active = self.active_runs();
        for run_id in &active {
            if let Err(e) = self.abort_run(run_id) {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to abort run on shutdown");
            }
        }
        let wait = self.inner.config.runs.abort_grace() + EXIT_MARGIN;
        for run_id in &active {
            let _ = self.wait_for_run(run_id, wait).await;
        }
        self.flush();
        tracing::info!(aborted = active.len(), "Orchestrator shut down");
        active.len()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}
