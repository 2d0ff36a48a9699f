//! Automation task table
//!
//! A task is created by an automation caller before any window, run or job
//! exists for it. It is later bound to a run or a job and finished when that
//! run/job ends. A periodic timeout check guarantees that no task stays
//! `queued` or `running` forever, even if the underlying run is lost.

use crate::config::TasksConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an automation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task record, persisted in the state snapshot under `mcpTasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTask {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub window_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub prompt_request_id: Option<String>,
    #[serde(default)]
    pub prompt_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result_text: Option<String>,
    #[serde(default)]
    pub result_status: Option<TaskStatus>,
    #[serde(default)]
    pub result_at: Option<DateTime<Utc>>,
}

/// Delivered whenever a task reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNotification {
    pub task_id: String,
    pub status: TaskStatus,
    pub window_id: Option<String>,
    pub run_id: Option<String>,
    pub job_id: Option<String>,
    pub result_text: Option<String>,
    pub error: Option<String>,
}

impl TaskNotification {
    fn from_task(task: &McpTask) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            window_id: task.window_id.clone(),
            run_id: task.run_id.clone(),
            job_id: task.job_id.clone(),
            result_text: task.result_text.clone(),
            error: task.error.clone(),
        }
    }
}

/// How a bound run or job ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub error: Option<String>,
    pub result_text: Option<String>,
}

/// Binding target for [`TaskTable::mark_running`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskBinding {
    Run(String),
    Job(String),
}

fn fill(slot: &mut Option<String>, value: Option<&str>) -> bool {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) if slot.as_deref().map_or(true, |s| s.trim().is_empty()) => {
            *slot = Some(v.to_string());
            true
        }
        _ => false,
    }
}

/// In-memory task table, insertion ordered.
#[derive(Debug, Clone)]
pub struct TaskTable {
    tasks: Vec<McpTask>,
    max_tasks: usize,
    queued_timeout: Duration,
    running_timeout: Duration,
}

impl TaskTable {
    pub fn new(config: &TasksConfig) -> Self {
        Self {
            tasks: vec![],
            max_tasks: config.max_tasks.max(1),
            queued_timeout: Duration::seconds(config.queued_timeout_secs as i64),
            running_timeout: Duration::seconds(config.running_timeout_secs as i64),
        }
    }

    /// Replace the table contents with persisted tasks.
    pub fn restore(&mut self, mut tasks: Vec<McpTask>) {
        tasks.sort_by_key(|t| t.created_at);
        self.tasks = tasks;
        self.evict();
    }

    pub fn get(&self, id: &str) -> Option<&McpTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut McpTask> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound {
                kind: "task",
                id: id.to_string(),
            })
    }

    pub fn list(&self) -> &[McpTask] {
        &self.tasks
    }

    /// Register a task; re-registering an id only fills in empty fields.
    pub fn register(
        &mut self,
        id: &str,
        input: &str,
        working_directory: Option<&str>,
        window_id: Option<&str>,
    ) -> Result<McpTask> {
        if id.trim().is_empty() {
            return Err(Error::InvalidArgument("task id is empty".to_string()));
        }

        if let Ok(task) = self.get_mut(id) {
            if task.input.trim().is_empty() && !input.trim().is_empty() {
                task.input = input.to_string();
            }
            fill(&mut task.working_directory, working_directory);
            fill(&mut task.window_id, window_id);
            return Ok(task.clone());
        }

        let task = McpTask {
            id: id.to_string(),
            status: TaskStatus::Queued,
            input: input.to_string(),
            working_directory: working_directory
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string),
            window_id: window_id.filter(|v| !v.trim().is_empty()).map(str::to_string),
            run_id: None,
            job_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            prompt_request_id: None,
            prompt_sent_at: None,
            result_text: None,
            result_status: None,
            result_at: None,
        };
        self.tasks.push(task.clone());
        self.evict();
        Ok(task)
    }

    /// Bind a queued task to its run or job and mark it running.
    pub fn mark_running(&mut self, id: &str, binding: TaskBinding) -> Result<McpTask> {
        let task = self.get_mut(id)?;
        if task.status.is_terminal() {
            return Ok(task.clone());
        }
        match binding {
            TaskBinding::Run(run_id) if !run_id.is_empty() => task.run_id = Some(run_id),
            TaskBinding::Job(job_id) if !job_id.is_empty() => task.job_id = Some(job_id),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "task {id} cannot run without a run or job id"
                )))
            }
        }
        task.status = TaskStatus::Running;
        task.started_at.get_or_insert_with(Utc::now);
        Ok(task.clone())
    }

    /// Finish a task. Returns `None` when it was already terminal.
    pub fn mark_finished(
        &mut self,
        id: &str,
        outcome: TaskOutcome,
    ) -> Result<Option<TaskNotification>> {
        let task = self.get_mut(id)?;
        if task.status.is_terminal() {
            return Ok(None);
        }
        let now = Utc::now();
        task.status = outcome.status;
        task.finished_at = Some(now);
        task.error = outcome.error;
        task.result_text = outcome.result_text;
        task.result_status = Some(outcome.status);
        task.result_at = Some(now);
        let notification = TaskNotification::from_task(task);
        self.evict();
        Ok(Some(notification))
    }

    /// Record that the result prompt for a task has been delivered.
    pub fn mark_prompt_sent(&mut self, id: &str, prompt_request_id: &str) -> Result<McpTask> {
        let task = self.get_mut(id)?;
        task.prompt_request_id = Some(prompt_request_id.to_string());
        task.prompt_sent_at = Some(Utc::now());
        Ok(task.clone())
    }

    /// Finish every live task bound to `binding`.
    pub fn finish_bound(
        &mut self,
        binding: &TaskBinding,
        outcome: &TaskOutcome,
    ) -> Vec<TaskNotification> {
        let ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .filter(|t| match binding {
                TaskBinding::Run(id) => t.run_id.as_deref() == Some(id.as_str()),
                TaskBinding::Job(id) => t.job_id.as_deref() == Some(id.as_str()),
            })
            .map(|t| t.id.clone())
            .collect();

        ids.iter()
            .filter_map(|id| self.mark_finished(id, outcome.clone()).ok().flatten())
            .collect()
    }

    /// Fail tasks that overstayed their queued/running deadline.
    pub fn check_timeouts(&mut self, now: DateTime<Utc>) -> Vec<TaskNotification> {
        let mut overdue = vec![];
        for task in &self.tasks {
            let message = match task.status {
                TaskStatus::Queued if now - task.created_at > self.queued_timeout => {
                    "task timed out while queued"
                }
                TaskStatus::Running
                    if now - task.started_at.unwrap_or(task.created_at)
                        > self.running_timeout =>
                {
                    "task timed out while running"
                }
                _ => continue,
            };
            overdue.push((task.id.clone(), message));
        }

        overdue
            .into_iter()
            .filter_map(|(id, message)| {
                tracing::warn!(task_id = %id, "{message}");
                self.mark_finished(
                    &id,
                    TaskOutcome {
                        status: TaskStatus::Failed,
                        error: Some(message.to_string()),
                        result_text: None,
                    },
                )
                .ok()
                .flatten()
            })
            .collect()
    }

    /// Drop the oldest terminal tasks while over capacity.
    fn evict(&mut self) {
        while self.tasks.len() > self.max_tasks {
            let oldest = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status.is_terminal())
                .min_by_key(|(_, t)| t.finished_at.unwrap_or(t.created_at))
                .map(|(idx, _)| idx);
            match oldest {
                Some(idx) => {
                    self.tasks.remove(idx);
                }
                None => break,
            }
        }
    }
}
