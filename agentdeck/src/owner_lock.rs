//! Process-level ownership of a data directory.
//!
//! Exactly one process may own a directory, i.e. write `state.json` and drain
//! `requests.json`. Ownership is an advisory OS file lock (flock) held for the
//! owner's lifetime; other processes read the snapshot and append requests
//! without it.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const OWNER_LOCK_FILE: &str = "agentdeck-owner.lock";

/// Held by the owning process; released on drop.
pub struct OwnerGuard {
    file: File,
    path: PathBuf,
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Become the owner of `data_dir`, failing if another process already is.
pub fn acquire_owner(data_dir: &Path) -> Result<OwnerGuard> {
    match try_acquire_owner(data_dir)? {
        Some(guard) => Ok(guard),
        None => anyhow::bail!(
            "another agentdeck process already owns {}",
            data_dir.display()
        ),
    }
}

fn try_acquire_owner(data_dir: &Path) -> Result<Option<OwnerGuard>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(OWNER_LOCK_FILE, data_dir));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = writeln!(file, "dir={}", data_dir.display());
            let _ = file.flush();
            tracing::debug!(lock = %path.display(), "Acquired directory ownership");
            Ok(Some(OwnerGuard { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("agentdeck");
    dir
}

fn scoped_lock_filename(base_filename: &str, data_dir: &Path) -> String {
    let canonical = data_dir
        .canonicalize()
        .unwrap_or_else(|_| data_dir.to_path_buf());
    let mut hasher = DefaultHasher::new();
    canonical.to_string_lossy().hash(&mut hasher);
    format!("{base_filename}.{:016x}", hasher.finish())
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || error.raw_os_error() == Some(libc::EWOULDBLOCK)
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    // SAFETY: flock on a descriptor owned by `file` with constant flags.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    // SAFETY: as above.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
compile_error!("agentdeck directory ownership currently requires Unix (macOS/Linux)");
