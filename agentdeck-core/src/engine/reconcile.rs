//! Applying the cross-process request queue to the live registries.
//!
//! Every entry is applied idempotently: a create-window entry for a window
//! that already exists merges into it and leaves it unchanged the second
//! time, and a start-run entry whose id already names a run is dropped.

use super::runner::LaunchOrigin;
use super::Orchestrator;
use crate::error::Error;
use crate::queue::{
    CreateWindowRequest, Disposition, Request, RequestFile, StartRunRequest,
};
use crate::types::{Window, WindowSource};
use chrono::Utc;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub windows_created: usize,
    pub windows_updated: usize,
    pub runs_started: usize,
    pub pending: usize,
    pub dropped: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        *self == ReconcileReport::default()
    }
}

impl Orchestrator {
    /// Drain the request queue into the registries.
    pub fn reconcile_requests(&self) -> crate::error::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let queue = self.inner.queue.clone();
        let drained = queue.drain(|request, pending| match request {
            Request::CreateWindow(entry) => self.apply_create(entry, &mut report),
            Request::StartRun(entry) => self.apply_start(entry, pending, &mut report),
        })?;
        report.pending = drained.pending;
        report.dropped = drained.dropped;

        if report.windows_created + report.windows_updated + report.runs_started > 0 {
            tracing::info!(
                created = report.windows_created,
                updated = report.windows_updated,
                started = report.runs_started,
                pending = report.pending,
                "Reconciled request queue"
            );
            self.inner.schedule_save();
        }
        Ok(report)
    }

    fn apply_create(&self, entry: &CreateWindowRequest, report: &mut ReconcileReport) -> Disposition {
        if entry.id.trim().is_empty() {
            tracing::warn!("Dropping create-window request without an id");
            return Disposition::Dropped;
        }
        if !entry.defaults.is_launchable() {
            return Disposition::Pending;
        }

        let thread_id = entry
            .thread_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let mut world = self.inner.world();
        match world.windows.get_mut(&entry.id) {
            Some(window) => {
                let merged = window.default_run_options.merge(&entry.defaults);
                let mut changed = merged != window.default_run_options;
                window.default_run_options = merged;
                if let Some(thread_id) = thread_id {
                    if window.thread_id != thread_id {
                        window.thread_id = thread_id.to_string();
                        changed = true;
                    }
                }
                if changed {
                    window.updated_at = Utc::now();
                    report.windows_updated += 1;
                    tracing::debug!(window_id = %entry.id, "Merged queued defaults into window");
                }
            }
            None => {
                let name = match entry.name.trim() {
                    "" => entry.id.clone(),
                    name => name.to_string(),
                };
                let mut window = Window::new(entry.id.clone(), name, WindowSource::Automation);
                window.default_run_options = entry.defaults.clone();
                window.thread_id = thread_id.unwrap_or_default().to_string();
                world.windows.insert(window.id.clone(), window);
                report.windows_created += 1;
                tracing::info!(window_id = %entry.id, "Created window from request queue");
            }
        }
        Disposition::Applied
    }

    fn apply_start(
        &self,
        entry: &StartRunRequest,
        pending: &RequestFile,
        report: &mut ReconcileReport,
    ) -> Disposition {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!(request_id = %entry.id, "No runtime, leaving start-run request queued");
            return Disposition::Pending;
        }

        {
            let world = self.inner.world();
            let duplicate = world
                .runs
                .values()
                .any(|s| s.run.request_id.as_deref() == Some(entry.id.as_str()));
            if duplicate {
                return Disposition::Applied;
            }
            match world.windows.get(&entry.window_id) {
                Some(window) if window.status.is_active() => return Disposition::Pending,
                Some(_) => {}
                None if pending
                    .create_windows
                    .iter()
                    .any(|w| w.id == entry.window_id) =>
                {
                    return Disposition::Pending
                }
                None => {
                    tracing::warn!(
                        request_id = %entry.id,
                        window_id = %entry.window_id,
                        "Dropping start-run request for unknown window"
                    );
                    return Disposition::Dropped;
                }
            }
        }

        if let Some(task_id) = &entry.task_id {
            let mut world = self.inner.world();
            if let Err(e) = world.tasks.register(
                task_id,
                &entry.input,
                entry.options.working_directory.as_deref(),
                Some(&entry.window_id),
            ) {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to register queued task");
            }
        }

        let exe = self.inner.executable.clone();
        let origin = LaunchOrigin {
            request_id: Some(entry.id.clone()),
            task_id: entry.task_id.clone(),
        };
        match self.launch(&entry.window_id, &entry.input, &exe, &entry.options, origin) {
            Ok(_) => {
                report.runs_started += 1;
                Disposition::Applied
            }
            Err(Error::AlreadyRunning { .. }) => Disposition::Pending,
            Err(e) => {
                tracing::warn!(request_id = %entry.id, error = %e, "Dropping start-run request");
                Disposition::Dropped
            }
        }
    }
}
