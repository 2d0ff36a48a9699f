//! The on-disk state snapshot and its debounced writer.
//!
//! One JSON document describes the whole world of an orchestrator: windows,
//! run summaries, per-window event logs, todo snapshots, input histories and
//! automation tasks. Other processes read it without any lock; the atomic
//! rename in [`crate::atomic`] guarantees they see a whole document.

use crate::atomic;
use crate::engine::poll::{self, PollResponse};
use crate::error::{Error, Result};
use crate::event::RunEvent;
use crate::paths::SharedDir;
use crate::protocol::TodoItem;
use crate::tasks::McpTask;
use crate::types::{InputHistory, Run, Window};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub const SNAPSHOT_VERSION: u32 = 1;

/// The persisted world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub windows: Vec<Window>,
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub window_logs: BTreeMap<String, WindowLog>,
    #[serde(default)]
    pub window_tasks: BTreeMap<String, WindowTodo>,
    #[serde(default)]
    pub window_inputs: BTreeMap<String, InputHistory>,
    #[serde(default)]
    pub mcp_tasks: Vec<McpTask>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            updated_at: Utc::now(),
            windows: vec![],
            runs: vec![],
            window_logs: BTreeMap::new(),
            window_tasks: BTreeMap::new(),
            window_inputs: BTreeMap::new(),
            mcp_tasks: vec![],
        }
    }
}

/// Recent events of every run in a window, plus a plain-text transcript.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowLog {
    #[serde(default)]
    pub events: Vec<RunEvent>,
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Latest todo snapshot published by a window's runs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowTodo {
    #[serde(default)]
    pub todo_list: Vec<TodoItem>,
    #[serde(default)]
    pub todo_list_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Read the snapshot in `dir`. A missing or empty file is `None`.
pub fn read_snapshot(dir: &SharedDir) -> Result<Option<StateSnapshot>> {
    atomic::read_json(&dir.state_path())
}

// ============================================
// Cross-process reader
// ============================================

/// Read-only view over a snapshot file, for processes that do not own the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    snapshot: StateSnapshot,
}

impl SnapshotView {
    /// Load the snapshot; a missing file yields an empty view.
    pub fn load(dir: &SharedDir) -> Result<Self> {
        Ok(Self {
            snapshot: read_snapshot(dir)?.unwrap_or_default(),
        })
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn windows(&self) -> &[Window] {
        &self.snapshot.windows
    }

    pub fn run(&self, run_id: &str) -> Option<&Run> {
        self.snapshot.runs.iter().find(|r| r.id == run_id)
    }

    /// Apply the poll protocol to the persisted events of `run_id`.
    pub fn poll(&self, run_id: &str, cursor: u64) -> Result<PollResponse> {
        let run = self.run(run_id).ok_or_else(|| Error::run_not_found(run_id))?;
        let events: Vec<RunEvent> = self
            .snapshot
            .window_logs
            .get(&run.window_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|e| e.run_id == run_id && !e.kind.is_gap())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let first_seq = events.first().map(|e| e.seq).unwrap_or(run.next_seq);
        Ok(poll::answer(
            run,
            first_seq,
            run.next_seq,
            run.dropped_events.max(first_seq),
            cursor,
            || events.iter().filter(|e| e.seq >= cursor).cloned().collect(),
        ))
    }
}

// ============================================
// Debounced writer
// ============================================

/// Something that can render itself as a JSON document.
pub trait SnapshotSource: Send + Sync + 'static {
    fn render(&self) -> Result<Vec<u8>>;
}

/// Coalesces write requests into one atomic write per debounce window.
///
/// The writer holds only a weak reference to its source, so an owner that
/// embeds its writer does not keep itself alive.
pub struct DebouncedWriter {
    path: PathBuf,
    delay: Duration,
    pending: AtomicBool,
    write_lock: Mutex<()>,
    source: Weak<dyn SnapshotSource>,
}

impl DebouncedWriter {
    pub fn new(path: PathBuf, delay: Duration, source: Weak<dyn SnapshotSource>) -> Self {
        Self {
            path,
            delay,
            pending: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            source,
        }
    }

    /// Request a write. Calls within the debounce window share one write.
    ///
    /// Outside a tokio runtime the write happens immediately.
    pub fn schedule(self: &Arc<Self>) {
        if self.pending.swap(true, Ordering::SeqCst) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let writer = Arc::clone(self);
                handle.spawn(async move {
                    tokio::time::sleep(writer.delay).await;
                    let _ = tokio::task::spawn_blocking(move || writer.write_if_pending()).await;
                });
            }
            Err(_) => self.write_if_pending(),
        }
    }

    /// Write now, cancelling any pending debounced write.
    pub fn flush(&self) {
        self.pending.store(false, Ordering::SeqCst);
        self.write_now();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn write_if_pending(&self) {
        if self.pending.swap(false, Ordering::SeqCst) {
            self.write_now();
        }
    }

    fn write_now(&self) {
        let Some(source) = self.source.upgrade() else {
            return;
        };
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = source
            .render()
            .and_then(|bytes| atomic::write_bytes(&self.path, &bytes));
        match result {
            Ok(()) => tracing::trace!(path = %self.path.display(), "snapshot written"),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to write snapshot")
            }
        }
    }
}

impl std::fmt::Debug for DebouncedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedWriter")
            .field("path", &self.path)
            .field("delay", &self.delay)
            .field("pending", &self.is_pending())
            .finish()
    }
}
