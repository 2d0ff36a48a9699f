//! Core domain types for agentdeck
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Window** | A resumable conversation identity, independent of any single run |
//! | **Run** | One execution of the agent against a window, streaming events until terminal |
//! | **Job** | A window-independent, fire-and-forget execution for automation callers |
//! | **Task** | An automation request that may exist before its run/job, subject to timeouts |
//! | **Cursor** | A consumer-held sequence number: the next event it has not seen |
//! | **Gap** | A poll answer saying the cursor is older than anything retained |
//!
//! All records serialize with camelCase field names; they are the on-disk
//! snapshot format read by other processes.

use crate::options::RunOptions;
use crate::protocol::TodoItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Windows
// ============================================

/// Status of a window.
///
/// The engine only writes `Idle`, `Running` and `Aborting`; the terminal
/// values are accepted when reading snapshots and count as inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    #[default]
    Idle,
    Running,
    Aborting,
    Completed,
    Failed,
    Aborted,
}

impl WindowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowStatus::Idle => "idle",
            WindowStatus::Running => "running",
            WindowStatus::Aborting => "aborting",
            WindowStatus::Completed => "completed",
            WindowStatus::Failed => "failed",
            WindowStatus::Aborted => "aborted",
        }
    }

    /// Whether a run currently owns this window.
    pub fn is_active(&self) -> bool {
        matches!(self, WindowStatus::Running | WindowStatus::Aborting)
    }
}

impl std::fmt::Display for WindowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a window came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    #[default]
    Interactive,
    Automation,
}

/// A resumable session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub id: String,
    pub name: String,
    /// External conversation id; empty until the agent announces one
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub status: WindowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Non-empty iff `status` is running/aborting
    #[serde(default)]
    pub active_run_id: String,
    #[serde(default)]
    pub default_run_options: RunOptions,
    #[serde(default)]
    pub last_run_options: Option<RunOptions>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub todo_list: Vec<TodoItem>,
    #[serde(default)]
    pub todo_list_id: Option<String>,
    #[serde(default)]
    pub todo_list_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: WindowSource,
}

impl Window {
    pub fn new(id: String, name: String, source: WindowSource) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            thread_id: String::new(),
            status: WindowStatus::Idle,
            created_at: now,
            updated_at: now,
            active_run_id: String::new(),
            default_run_options: RunOptions::default(),
            last_run_options: None,
            last_run_at: None,
            todo_list: vec![],
            todo_list_id: None,
            todo_list_updated_at: None,
            source,
        }
    }

    /// Return to idle, releasing the active run.
    pub fn release(&mut self) {
        self.status = WindowStatus::Idle;
        self.active_run_id.clear();
        self.updated_at = Utc::now();
    }
}

// ============================================
// Runs
// ============================================

/// Run lifecycle: `running → aborting? → completed | failed | aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Aborting,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Aborting => "aborting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted description of a run; the event buffer lives beside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub window_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub next_seq: u64,
    #[serde(default)]
    pub dropped_events: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Request-queue entry or caller id that created this run
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub todo_list: Vec<TodoItem>,
}

// ============================================
// Per-window side tables
// ============================================

/// Inputs submitted to a window, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputHistory {
    pub items: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl InputHistory {
    pub fn new() -> Self {
        Self {
            items: vec![],
            updated_at: Utc::now(),
        }
    }

    /// Record an input, collapsing consecutive duplicates and keeping `limit` items.
    pub fn record(&mut self, input: &str, limit: usize) {
        let input = input.trim();
        if input.is_empty() {
            return;
        }
        if self.items.last().map(String::as_str) != Some(input) {
            self.items.push(input.to_string());
        }
        if self.items.len() > limit {
            let excess = self.items.len() - limit;
            self.items.drain(..excess);
        }
        self.updated_at = Utc::now();
    }
}

impl Default for InputHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded plain-text transcript of a window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transcript {
    pub lines: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Transcript {
    pub fn push(&mut self, line: String, limit: usize) {
        self.lines.push(line);
        if self.lines.len() > limit {
            let excess = self.lines.len() - limit;
            self.lines.drain(..excess);
        }
        self.updated_at = Some(Utc::now());
    }
}
