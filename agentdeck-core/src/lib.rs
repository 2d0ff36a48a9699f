//! # agentdeck-core
//!
//! Core library for agentdeck, an orchestrator for long-running agent
//! sessions.
//!
//! This library provides:
//! - Windows (resumable agent sessions) and runs (one agent process each)
//! - A bounded per-run event log with a cursor-based poll protocol
//! - A debounced, atomically written state snapshot shared across processes
//! - A file-locked request queue other processes use to create windows and
//!   start runs
//! - An async job store and automation task table with timeouts
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Processes cooperate through one shared directory:
//! - **`state.json`:** written only by the owner of the directory, read by anyone
//! - **`requests.json`:** appended by producers, drained by the owner
//! - **`jobs.json`:** async job records
//!
//! ## Example
//!
//! ```rust,no_run
//! use agentdeck_core::{Config, NewWindow, Orchestrator, SharedDir};
//!
//! # async fn demo() -> agentdeck_core::Result<()> {
//! let config = Config::load()?;
//! let deck = Orchestrator::open(SharedDir::resolve(), config)?;
//!
//! let window = deck.create_window(NewWindow::named("refactor"))?;
//! let exe = deck.executable().clone();
//! let run_id = deck.start_run(&window.id, "tidy up src/", &exe, &Default::default())?;
//!
//! let page = deck.poll(&run_id, 0)?;
//! println!("{} events, done: {}", page.events.len(), page.done);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use engine::poll::PollResponse;
pub use engine::{NewWindow, Orchestrator, ReconcileReport};
pub use error::{Error, Result};
pub use event::{EventKind, RunEvent};
pub use jobs::{JobRecord, JobStatus, JobStore};
pub use options::{ExecutableRef, RunOptions};
pub use paths::SharedDir;
pub use queue::RequestQueue;
pub use snapshot::{SnapshotView, StateSnapshot};
pub use store::{StoreHandle, StoreRegistry};
pub use tasks::{McpTask, TaskStatus};
pub use types::*;

// Public modules
pub mod atomic;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod jobs;
pub mod logging;
pub mod options;
pub mod paths;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod snapshot;
pub mod store;
pub mod tasks;
pub mod types;
