//! Error types for agentdeck-core

use thiserror::Error;

/// Main error type for the agentdeck-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A window, run, job or task id that is not known to the store
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The window already has an active run
    #[error("window {window_id} already has an active run (status: {status})")]
    AlreadyRunning { window_id: String, status: String },

    /// Caller supplied an unusable argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Job result requested while the job is still active.
    ///
    /// This is a retryable precondition rather than a failure.
    #[error("job {job_id} is still {status}")]
    StillRunning { job_id: String, status: String },

    /// The external executable could not be started
    #[error("failed to spawn agent process: {0}")]
    Spawn(String),
}

impl Error {
    pub(crate) fn window_not_found(id: &str) -> Self {
        Error::NotFound {
            kind: "window",
            id: id.to_string(),
        }
    }

    pub(crate) fn run_not_found(id: &str) -> Self {
        Error::NotFound {
            kind: "run",
            id: id.to_string(),
        }
    }

    /// Whether the caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StillRunning { .. })
    }
}

/// Result type alias for agentdeck-core
pub type Result<T> = std::result::Result<T, Error>;
