//! Shared data directory resolution
//!
//! Every process that cooperates on the same set of windows must agree on one
//! directory. The directory holds:
//!
//! ```text
//! <dir>/state.json          orchestrator snapshot
//! <dir>/requests.json       cross-process request queue
//! <dir>/requests.json.lock  queue writer lock
//! <dir>/jobs.json           async job store
//! ```

use crate::config::Config;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the data directory
pub const DATA_DIR_ENV: &str = "AGENTDECK_DATA_DIR";

const STATE_FILE: &str = "state.json";
const REQUESTS_FILE: &str = "requests.json";
const JOBS_FILE: &str = "jobs.json";

/// A resolved data directory shared between cooperating processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedDir {
    root: PathBuf,
}

impl SharedDir {
    /// Use an explicit directory (tests, `--data-dir`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the installation-wide directory.
    ///
    /// `$AGENTDECK_DATA_DIR` wins when set and non-empty, otherwise
    /// `$XDG_DATA_HOME/agentdeck`.
    pub fn resolve() -> Self {
        match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(PathBuf::from(dir)),
            _ => Self::new(Config::data_dir()),
        }
    }

    /// Scope the directory to one workspace root.
    ///
    /// Two processes opened on the same workspace land on the same directory
    /// regardless of how the path was spelled.
    pub fn for_workspace(&self, workspace: &Path) -> Self {
        let canonical = workspace
            .canonicalize()
            .unwrap_or_else(|_| workspace.to_path_buf());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let key = hex::encode(&digest[..8]);
        Self::new(self.root.join("workspaces").join(key))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn requests_path(&self) -> PathBuf {
        self.root.join(REQUESTS_FILE)
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.root.join(JOBS_FILE)
    }

    /// Create the directory if needed.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Key used by the store registry: the canonical path when it exists.
    pub fn registry_key(&self) -> PathBuf {
        self.root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_layout() {
        let dir = SharedDir::new("/tmp/deck");
        assert_eq!(dir.state_path(), PathBuf::from("/tmp/deck/state.json"));
        assert_eq!(dir.requests_path(), PathBuf::from("/tmp/deck/requests.json"));
        assert_eq!(dir.jobs_path(), PathBuf::from("/tmp/deck/jobs.json"));
    }

    #[test]
    fn test_workspace_scope_is_stable() {
        let temp = tempfile::TempDir::new().unwrap();
        let base = SharedDir::new(temp.path().join("data"));
        let workspace = temp.path().join("project");
        std::fs::create_dir_all(&workspace).unwrap();

        let a = base.for_workspace(&workspace);
        let b = base.for_workspace(&workspace.join("."));
        assert_eq!(a, b);
        assert!(a.root().starts_with(base.root().join("workspaces")));

        let other = base.for_workspace(temp.path());
        assert_ne!(a, other);
    }
}
