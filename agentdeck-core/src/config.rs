//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/agentdeck/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/agentdeck/` (~/.config/agentdeck/)
//! - Data: `$XDG_DATA_HOME/agentdeck/` (~/.local/share/agentdeck/)
//! - State/Logs: `$XDG_STATE_HOME/agentdeck/` (~/.local/state/agentdeck/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External agent executable
    #[serde(default)]
    pub agent: AgentConfig,

    /// Run engine limits
    #[serde(default)]
    pub runs: RunsConfig,

    /// Snapshot persistence
    #[serde(default)]
    pub store: StoreConfig,

    /// Async job store limits
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Automation task timeouts
    #[serde(default)]
    pub tasks: TasksConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Which executable a run spawns.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Program name or path, resolved through `PATH`
    #[serde(default = "default_agent_executable")]
    pub executable: String,

    /// Arguments placed before the generated `exec ...` arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: default_agent_executable(),
            extra_args: vec![],
        }
    }
}

fn default_agent_executable() -> String {
    "codex".to_string()
}

/// Run engine limits
#[derive(Debug, Deserialize, Clone)]
pub struct RunsConfig {
    /// Maximum events retained in memory per run
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Maximum bytes of text stored in a single stderr/raw event
    #[serde(default = "default_event_text_limit")]
    pub event_text_limit: usize,

    /// Grace period between graceful and forceful termination
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,

    /// Inputs remembered per window
    #[serde(default = "default_input_history_limit")]
    pub input_history_limit: usize,

    /// Finished runs kept per window before the oldest are forgotten
    #[serde(default = "default_finished_runs_per_window")]
    pub finished_runs_per_window: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            event_text_limit: default_event_text_limit(),
            abort_grace_ms: default_abort_grace_ms(),
            input_history_limit: default_input_history_limit(),
            finished_runs_per_window: default_finished_runs_per_window(),
        }
    }
}

impl RunsConfig {
    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

fn default_max_events() -> usize {
    2500
}

fn default_event_text_limit() -> usize {
    16 * 1024
}

fn default_abort_grace_ms() -> u64 {
    1500
}

fn default_input_history_limit() -> usize {
    50
}

fn default_finished_runs_per_window() -> usize {
    20
}

/// Snapshot persistence configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Delay used to coalesce snapshot writes
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Events persisted per window log
    #[serde(default = "default_window_log_events")]
    pub window_log_events: usize,

    /// Transcript lines kept per window log
    #[serde(default = "default_window_log_lines")]
    pub window_log_lines: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            window_log_events: default_window_log_events(),
            window_log_lines: default_window_log_lines(),
        }
    }
}

impl StoreConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_debounce_ms() -> u64 {
    120
}

fn default_window_log_events() -> usize {
    500
}

fn default_window_log_lines() -> usize {
    400
}

/// Async job store limits
#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    /// Bytes of stdout retained per job
    #[serde(default = "default_job_stdout_limit")]
    pub stdout_limit: usize,

    /// Bytes of stderr retained per job
    #[serde(default = "default_job_stderr_limit")]
    pub stderr_limit: usize,

    /// Heartbeat interval while a job is active
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Finished jobs kept before the oldest are pruned
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            stdout_limit: default_job_stdout_limit(),
            stderr_limit: default_job_stderr_limit(),
            heartbeat_secs: default_heartbeat_secs(),
            max_jobs: default_max_jobs(),
        }
    }
}

fn default_job_stdout_limit() -> usize {
    256 * 1024
}

fn default_job_stderr_limit() -> usize {
    64 * 1024
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_max_jobs() -> usize {
    100
}

/// Automation task timeouts
#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    /// Seconds a task may stay queued
    #[serde(default = "default_queued_timeout")]
    pub queued_timeout_secs: u64,

    /// Seconds a task may stay running
    #[serde(default = "default_running_timeout")]
    pub running_timeout_secs: u64,

    /// Tasks kept before terminal ones are evicted
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,

    /// How often the timeout monitor runs
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            queued_timeout_secs: default_queued_timeout(),
            running_timeout_secs: default_running_timeout(),
            max_tasks: default_max_tasks(),
            check_interval_secs: default_check_interval(),
        }
    }
}

fn default_queued_timeout() -> u64 {
    10 * 60
}

fn default_running_timeout() -> u64 {
    60 * 60
}

fn default_max_tasks() -> usize {
    200
}

fn default_check_interval() -> u64 {
    15
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make the engine unusable
    pub fn validate(&self) -> Result<()> {
        if self.runs.max_events < 10 {
            return Err(Error::Config(
                "runs.max_events must be at least 10".to_string(),
            ));
        }
        if self.runs.event_text_limit == 0 {
            return Err(Error::Config(
                "runs.event_text_limit must be positive".to_string(),
            ));
        }
        if self.agent.executable.trim().is_empty() {
            return Err(Error::Config("agent.executable is empty".to_string()));
        }
        if self.tasks.max_tasks == 0 {
            return Err(Error::Config("tasks.max_tasks must be positive".to_string()));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/agentdeck/config.toml` (~/.config/agentdeck/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("agentdeck").join("config.toml")
    }

    /// Returns the data directory path (snapshot, queue and job files)
    ///
    /// `$XDG_DATA_HOME/agentdeck/` (~/.local/share/agentdeck/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("agentdeck")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/agentdeck/` (~/.local/state/agentdeck/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("agentdeck")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/agentdeck/agentdeck.log` (~/.local/state/agentdeck/agentdeck.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("agentdeck.log")
    }
}
