//! Process-wide registry of open stores.
//!
//! Every frontend in one process that opens the same data directory shares a
//! single [`Orchestrator`] and [`JobStore`]. Handles are reference counted;
//! the last [`StoreRegistry::release`] aborts active work, flushes and
//! forgets the store.

use crate::config::Config;
use crate::engine::Orchestrator;
use crate::error::Result;
use crate::jobs::{JobEvent, JobStatus, JobStore};
use crate::paths::SharedDir;
use crate::tasks::{TaskBinding, TaskOutcome, TaskStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// A shared store: the orchestrator and job store of one directory.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    key: PathBuf,
    pub orchestrator: Orchestrator,
    pub jobs: JobStore,
}

impl StoreHandle {
    /// Canonical directory this handle was registered under.
    pub fn key(&self) -> &PathBuf {
        &self.key
    }
}

struct Entry {
    handle: StoreHandle,
    refs: usize,
    forwarder: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct StoreRegistry {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> &'static StoreRegistry {
        static GLOBAL: OnceLock<StoreRegistry> = OnceLock::new();
        GLOBAL.get_or_init(StoreRegistry::new)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open (or share) the store for `dir`.
    ///
    /// `config` is only used when this call opens the store.
    pub fn acquire(&self, dir: &SharedDir, config: &Config) -> Result<StoreHandle> {
        dir.ensure()?;
        let key = dir.registry_key();
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(&key) {
            entry.refs += 1;
            tracing::debug!(dir = %key.display(), refs = entry.refs, "Store shared");
            return Ok(entry.handle.clone());
        }

        let orchestrator = Orchestrator::open(dir.clone(), config.clone())?;
        let jobs = JobStore::open(dir, config)?;
        let handle = StoreHandle {
            key: key.clone(),
            orchestrator,
            jobs,
        };
        let forwarder = spawn_forwarder(&handle);
        entries.insert(
            key.clone(),
            Entry {
                handle: handle.clone(),
                refs: 1,
                forwarder,
            },
        );
        tracing::info!(dir = %key.display(), "Store opened");
        Ok(handle)
    }

    /// Drop one reference. The last release shuts the store down and
    /// returns `true`.
    pub async fn release(&self, handle: StoreHandle) -> bool {
        let removed = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(&handle.key) else {
                return false;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return false;
            }
            entries.remove(&handle.key)
        };

        let Some(entry) = removed else {
            return false;
        };
        entry.handle.orchestrator.shutdown().await;
        entry.handle.jobs.shutdown().await;
        if let Some(forwarder) = entry.forwarder {
            forwarder.abort();
        }
        tracing::info!(dir = %handle.key.display(), "Store released");
        true
    }

    /// Number of references held on the store for `dir`.
    pub fn refs(&self, dir: &SharedDir) -> usize {
        self.entries()
            .get(&dir.registry_key())
            .map(|e| e.refs)
            .unwrap_or(0)
    }
}

fn job_outcome(event: &JobEvent) -> TaskOutcome {
    let status = match event.status {
        JobStatus::Finished => TaskStatus::Completed,
        JobStatus::Aborted => TaskStatus::Aborted,
        _ => TaskStatus::Failed,
    };
    TaskOutcome {
        status,
        error: event.error.clone(),
        result_text: event.result_text.clone(),
    }
}

/// Finish tasks bound to a job when the job ends.
fn spawn_forwarder(handle: &StoreHandle) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::debug!("No runtime, job events will not reach the task table");
        return None;
    };
    let mut events = handle.jobs.subscribe();
    let orchestrator = handle.orchestrator.clone();
    Some(runtime.spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let binding = TaskBinding::Job(event.job_id.clone());
                    orchestrator.finish_bound_tasks(&binding, &job_outcome(&event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Job event forwarder lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }))
}
