//! Task operations on the orchestrator and the periodic timeout monitor.

use super::Orchestrator;
use crate::error::Result;
use crate::tasks::{McpTask, TaskBinding, TaskNotification, TaskOutcome};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

impl Orchestrator {
    /// Register an automation task (idempotent by id).
    pub fn register_task(
        &self,
        id: &str,
        input: &str,
        working_directory: Option<&str>,
        window_id: Option<&str>,
    ) -> Result<McpTask> {
        let task = self
            .inner
            .world()
            .tasks
            .register(id, input, working_directory, window_id)?;
        self.inner.schedule_save();
        Ok(task)
    }

    pub fn mark_task_running(&self, id: &str, binding: TaskBinding) -> Result<McpTask> {
        let task = self.inner.world().tasks.mark_running(id, binding)?;
        self.inner.schedule_save();
        Ok(task)
    }

    pub fn mark_task_finished(&self, id: &str, outcome: TaskOutcome) -> Result<McpTask> {
        let (task, notification) = {
            let mut world = self.inner.world();
            let notification = world.tasks.mark_finished(id, outcome)?;
            let task = world.tasks.get(id).cloned();
            (task, notification)
        };
        self.inner.notify(notification.into_iter().collect());
        self.inner.schedule_save();
        task.ok_or_else(|| crate::error::Error::NotFound {
            kind: "task",
            id: id.to_string(),
        })
    }

    pub fn mark_prompt_sent(&self, id: &str, prompt_request_id: &str) -> Result<McpTask> {
        let task = self
            .inner
            .world()
            .tasks
            .mark_prompt_sent(id, prompt_request_id)?;
        self.inner.schedule_save();
        Ok(task)
    }

    /// Finish every live task bound to a run or job.
    pub fn finish_bound_tasks(&self, binding: &TaskBinding, outcome: &TaskOutcome) {
        let notifications = self.inner.world().tasks.finish_bound(binding, outcome);
        if !notifications.is_empty() {
            self.inner.notify(notifications);
            self.inner.schedule_save();
        }
    }

    pub fn get_task(&self, id: &str) -> Option<McpTask> {
        self.inner.world().tasks.get(id).cloned()
    }

    pub fn list_tasks(&self) -> Vec<McpTask> {
        self.inner.world().tasks.list().to_vec()
    }

    /// Fail every task that is overdue at `now`.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<TaskNotification> {
        let fired = self.inner.world().tasks.check_timeouts(now);
        if !fired.is_empty() {
            self.inner.notify(fired.clone());
            self.inner.schedule_save();
        }
        fired
    }

    /// Run [`Orchestrator::check_timeouts`] every `interval` until `cancel` fires.
    pub fn spawn_timeout_monitor(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let deck = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let fired = deck.check_timeouts(Utc::now());
                        if !fired.is_empty() {
                            tracing::debug!(count = fired.len(), "Timed out tasks");
                        }
                    }
                }
            }
        })
    }
}
