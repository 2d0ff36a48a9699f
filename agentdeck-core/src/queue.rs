//! Cross-process request queue.
//!
//! A producer that does not own the orchestrator appends requests to
//! `requests.json`; the orchestrator drains them during reconciliation.
//! Delivery is at-least-once: an entry is only removed after it has been
//! applied, so a crash between apply and rewrite re-applies it and the
//! consumer must be idempotent.
//!
//! Every read-modify-write of the file, by producers and by the consumer,
//! holds an exclusive advisory lock on `requests.json.lock`, so two producers
//! appending at the same time cannot lose each other's entries.

use crate::atomic;
use crate::error::Result;
use crate::options::RunOptions;
use crate::paths::SharedDir;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

pub const QUEUE_VERSION: u32 = 1;

/// Request to create (or update) a window with a known id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWindowRequest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub defaults: RunOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request to start a run on a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub id: String,
    pub window_id: String,
    pub input: String,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The queue document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFile {
    pub version: u32,
    #[serde(default)]
    pub create_windows: Vec<CreateWindowRequest>,
    #[serde(default)]
    pub start_runs: Vec<StartRunRequest>,
}

impl Default for RequestFile {
    fn default() -> Self {
        Self {
            version: QUEUE_VERSION,
            create_windows: vec![],
            start_runs: vec![],
        }
    }
}

impl RequestFile {
    pub fn is_empty(&self) -> bool {
        self.create_windows.is_empty() && self.start_runs.is_empty()
    }
}

/// One pending entry handed to the consumer.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    CreateWindow(&'a CreateWindowRequest),
    StartRun(&'a StartRunRequest),
}

/// What the consumer did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Applied; remove from the queue
    Applied,
    /// Not applicable yet; keep for a later pass
    Pending,
    /// Can never be applied; remove
    Dropped,
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub pending: usize,
    pub dropped: usize,
}

/// Handle to the queue file of one data directory.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    path: PathBuf,
    lock_path: PathBuf,
}

impl RequestQueue {
    pub fn new(dir: &SharedDir) -> Self {
        let path = dir.requests_path();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Producer: append a create-window request.
    pub fn append_window(&self, request: CreateWindowRequest) -> Result<()> {
        self.update(|file| {
            file.create_windows.push(request);
            true
        })
    }

    /// Producer: append a start-run request.
    pub fn append_run(&self, request: StartRunRequest) -> Result<()> {
        self.update(|file| {
            file.start_runs.push(request);
            true
        })
    }

    /// Current pending entries, read without taking the lock.
    pub fn pending(&self) -> Result<RequestFile> {
        Ok(atomic::read_json(&self.path)?.unwrap_or_default())
    }

    /// Consumer: offer every pending entry to `consume`, create-window
    /// entries first, and rewrite the file with what remains.
    ///
    /// `consume` sees the entries still pending at the time it is called, so
    /// a start-run entry can tell whether its window is merely not created
    /// yet.
    pub fn drain<F>(&self, mut consume: F) -> Result<DrainReport>
    where
        F: FnMut(Request<'_>, &RequestFile) -> Disposition,
    {
        let mut report = DrainReport::default();
        self.update(|file| {
            if file.is_empty() {
                return false;
            }
            let snapshot = file.clone();

            let mut kept_windows = Vec::with_capacity(file.create_windows.len());
            for entry in std::mem::take(&mut file.create_windows) {
                match consume(Request::CreateWindow(&entry), &snapshot) {
                    Disposition::Applied => report.applied += 1,
                    Disposition::Dropped => report.dropped += 1,
                    Disposition::Pending => {
                        report.pending += 1;
                        kept_windows.push(entry);
                    }
                }
            }
            file.create_windows = kept_windows;

            let pending_now = file.clone();
            let mut kept_runs = Vec::with_capacity(file.start_runs.len());
            for entry in std::mem::take(&mut file.start_runs) {
                match consume(Request::StartRun(&entry), &pending_now) {
                    Disposition::Applied => report.applied += 1,
                    Disposition::Dropped => report.dropped += 1,
                    Disposition::Pending => {
                        report.pending += 1;
                        kept_runs.push(entry);
                    }
                }
            }
            file.start_runs = kept_runs;

            report.applied + report.dropped > 0
        })?;
        Ok(report)
    }

    /// Locked read-modify-write. `mutate` returns whether to write back.
    fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RequestFile) -> bool,
    {
        let _lock = QueueLock::acquire(&self.lock_path)?;
        let mut file: RequestFile = atomic::read_json(&self.path)?.unwrap_or_default();
        if mutate(&mut file) {
            file.version = QUEUE_VERSION;
            atomic::write_json(&self.path, &file)?;
        }
        Ok(())
    }
}

/// Exclusive advisory lock on the queue's sibling lock file, held until drop.
struct QueueLock {
    file: File,
}

impl QueueLock {
    fn acquire(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock_exclusive(&file)?;
        Ok(Self { file })
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = unlock(&self.file);
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    loop {
        // SAFETY: flock is called with a valid file descriptor and constant flags.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn window(id: &str) -> CreateWindowRequest {
        CreateWindowRequest {
            id: id.to_string(),
            name: format!("window {id}"),
            defaults: RunOptions::default(),
            thread_id: None,
            created_at: Utc::now(),
        }
    }

    fn run(id: &str, window_id: &str) -> StartRunRequest {
        StartRunRequest {
            id: id.to_string(),
            window_id: window_id.to_string(),
            input: "hi".into(),
            options: RunOptions::default(),
            task_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_drain_keeps_pending_entries() {
        let dir = TempDir::new().unwrap();
        let queue = RequestQueue::new(&SharedDir::new(dir.path()));
        queue.append_window(window("a")).unwrap();
        queue.append_window(window("b")).unwrap();
        queue.append_run(run("r1", "a")).unwrap();

        let report = queue
            .drain(|request, _| match request {
                Request::CreateWindow(w) if w.id == "a" => Disposition::Applied,
                Request::CreateWindow(_) => Disposition::Pending,
                Request::StartRun(_) => Disposition::Dropped,
            })
            .unwrap();
        assert_eq!(
            report,
            DrainReport {
                applied: 1,
                pending: 1,
                dropped: 1
            }
        );

        let left = queue.pending().unwrap();
        assert_eq!(left.create_windows.len(), 1);
        assert_eq!(left.create_windows[0].id, "b");
        assert!(left.start_runs.is_empty());
    }

    #[test]
    fn test_run_entries_see_remaining_windows() {
        let dir = TempDir::new().unwrap();
        let queue = RequestQueue::new(&SharedDir::new(dir.path()));
        queue.append_window(window("a")).unwrap();
        queue.append_run(run("r1", "a")).unwrap();

        let mut saw_window_pending = None;
        queue
            .drain(|request, pending| match request {
                Request::CreateWindow(_) => Disposition::Pending,
                Request::StartRun(r) => {
                    saw_window_pending =
                        Some(pending.create_windows.iter().any(|w| w.id == r.window_id));
                    Disposition::Pending
                }
            })
            .unwrap();
        assert_eq!(saw_window_pending, Some(true));
    }

    #[test]
    fn test_concurrent_producers_do_not_lose_entries() {
        let dir = TempDir::new().unwrap();
        let shared = SharedDir::new(dir.path());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = RequestQueue::new(&shared);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        queue.append_window(window(&format!("{t}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let queue = RequestQueue::new(&shared);
        assert_eq!(queue.pending().unwrap().create_windows.len(), 80);
    }

    #[test]
    fn test_empty_queue_is_not_written() {
        let dir = TempDir::new().unwrap();
        let queue = RequestQueue::new(&SharedDir::new(dir.path()));
        let report = queue.drain(|_, _| Disposition::Applied).unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(!queue.path().exists());
    }
}
