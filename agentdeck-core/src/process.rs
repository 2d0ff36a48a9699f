//! Spawning and terminating agent processes.
//!
//! Children are started in their own process group so that termination
//! reaches anything they spawned in turn. Shutdown is two-phase: SIGTERM to
//! the group, a grace period, then SIGKILL.

use crate::error::{Error, Result};
use crate::options::ExecutableRef;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Spawn `exe` with `args` appended, piping all three standard streams.
///
/// The caller takes `stdout`/`stderr` from the returned child; stdin is
/// written by [`send_input`].
pub fn spawn(exe: &ExecutableRef, args: &[String], cwd: Option<&Path>) -> Result<Child> {
    let mut command = Command::new(&exe.program);
    command
        .args(&exe.args)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    #[cfg(unix)]
    command.process_group(0);

    command
        .spawn()
        .map_err(|e| Error::Spawn(format!("{}: {}", exe.program.display(), e)))
}

/// Write the prompt to the child's stdin and close it.
///
/// Runs on its own task so a child that never reads stdin cannot stall the
/// caller. Broken pipes are ignored; the exit status tells the real story.
pub fn send_input(child: &mut Child, input: String) {
    let Some(mut stdin) = child.stdin.take() else {
        return;
    };
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            tracing::debug!(error = %e, "failed to write agent input");
            return;
        }
        let _ = stdin.shutdown().await;
    });
}

/// Terminate the child's process group, escalating after `grace`.
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    match child.id() {
        Some(pid) => signal_group(pid, Signal::Term),
        None => return child.wait().await,
    }

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }

    tracing::debug!(pid = ?child.id(), "grace period elapsed, killing process group");
    if let Some(pid) = child.id() {
        signal_group(pid, Signal::Kill);
    }
    let _ = child.start_kill();
    child.wait().await
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a negative pid targets the process group created
    // at spawn time; no memory is shared with the callee.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc != 0 {
        tracing::debug!(
            pid,
            error = %std::io::Error::last_os_error(),
            "failed to signal process group"
        );
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

/// Exit code and terminating signal of a finished process.
pub fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

/// Human-readable failure for a non-successful exit, `None` on success.
pub fn describe_failure(status: &ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    match exit_parts(status) {
        (Some(code), _) => Some(format!("exited with code {code}")),
        (None, Some(signal)) => Some(format!("terminated by signal {signal}")),
        (None, None) => Some("exited abnormally".to_string()),
    }
}
