//! Data directory selection shared by both binaries.

use agentdeck_core::SharedDir;
use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Clone, Args)]
pub struct DirArgs {
    /// Data directory (defaults to $AGENTDECK_DATA_DIR or the XDG data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Scope the data directory to this workspace root
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,
}

impl DirArgs {
    pub fn resolve(&self) -> SharedDir {
        let base = match &self.data_dir {
            Some(dir) => SharedDir::new(dir),
            None => SharedDir::resolve(),
        };
        match &self.workspace {
            Some(workspace) => base.for_workspace(workspace),
            None => base,
        }
    }
}
