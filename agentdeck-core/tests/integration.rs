//! Integration tests for the orchestrator, request queue and job store
//!
//! Agent executables are `sh -c` scripts; the generated `exec --json ...`
//! arguments land in the script's positional parameters and are ignored.

use agentdeck_core::engine::poll::PollResponse;
use agentdeck_core::jobs::JobLink;
use agentdeck_core::protocol::TodoItem;
use agentdeck_core::queue::{CreateWindowRequest, StartRunRequest};
use agentdeck_core::tasks::TaskStatus;
use agentdeck_core::{
    atomic, Config, Error, EventKind, ExecutableRef, JobStatus, JobStore, NewWindow, Orchestrator,
    RequestQueue, RunOptions, RunStatus, SharedDir, SnapshotView, WindowStatus,
};
use chrono::Utc;
use std::time::Duration;
use tempfile::TempDir;

fn stub(script: &str) -> ExecutableRef {
    ExecutableRef::new("sh").with_args(["-c", script, "agent"])
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.runs.abort_grace_ms = 500;
    config.store.debounce_ms = 10;
    config.agent.executable = "sh".into();
    config.agent.extra_args = vec!["-c".into(), "cat >/dev/null".into(), "agent".into()];
    config
}

fn open(dir: &TempDir) -> Orchestrator {
    Orchestrator::open(SharedDir::new(dir.path()), test_config()).expect("open orchestrator")
}

/// Poll from cursor 0 until the run reports `done`, collecting every page.
async fn poll_until_done(deck: &Orchestrator, run_id: &str) -> Vec<PollResponse> {
    let mut cursor = 0;
    let mut pages = vec![];
    for _ in 0..200 {
        let page = deck.poll(run_id, cursor).unwrap();
        cursor = page.next_cursor;
        let done = page.done;
        pages.push(page);
        if done {
            return pages;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run {run_id} never finished");
}

fn queued_window(id: &str) -> CreateWindowRequest {
    CreateWindowRequest {
        id: id.to_string(),
        name: "auto".to_string(),
        defaults: RunOptions {
            working_directory: Some("/tmp".into()),
            sandbox_mode: Some("x".into()),
            ..Default::default()
        },
        thread_id: None,
        created_at: Utc::now(),
    }
}

// ============================================
// Run lifecycle
// ============================================

#[tokio::test]
async fn test_thread_announcement_reaches_window() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let window = deck.create_window(NewWindow::named("W1")).unwrap();

    let exe = stub(r#"cat >/dev/null; echo '{"type":"thread.started","thread_id":"t-1"}'"#);
    let run_id = deck
        .start_run(&window.id, "hello", &exe, &RunOptions::default())
        .unwrap();

    let pages = poll_until_done(&deck, &run_id).await;
    let events: Vec<_> = pages.iter().flat_map(|p| p.events.iter()).collect();
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::Stdout { payload } if payload["thread_id"] == "t-1")));

    let run = deck.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.exit_code, Some(0));
    let window = deck.get_window(&window.id).unwrap();
    assert_eq!(window.thread_id, "t-1");
    assert_eq!(window.status, WindowStatus::Idle);
    assert!(window.active_run_id.is_empty());
    assert_eq!(deck.input_history(&window.id).unwrap().items, vec!["hello"]);
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let window = deck.create_window(NewWindow::named("W1")).unwrap();
    let exe = stub("sleep 1");

    let run_id = deck
        .start_run(&window.id, "first", &exe, &RunOptions::default())
        .unwrap();
    let before = deck.get_window(&window.id).unwrap();

    match deck.start_run(&window.id, "second", &exe, &RunOptions::default()) {
        Err(Error::AlreadyRunning { window_id, status }) => {
            assert_eq!(window_id, window.id);
            assert_eq!(status, "running");
        }
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }
    assert_eq!(deck.get_window(&window.id).unwrap(), before);
    assert_eq!(deck.list_runs(&window.id).unwrap().len(), 1);

    let run = deck.wait_for_run(&run_id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_event_flood_yields_gap() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    assert_eq!(deck.config().runs.max_events, 2500);
    let window = deck.create_window(NewWindow::named("flood")).unwrap();

    let exe = stub(
        r#"i=0; while [ $i -lt 10000 ]; do echo '{"type":"turn.started"}'; i=$((i+1)); done"#,
    );
    let run_id = deck
        .start_run(&window.id, "flood", &exe, &RunOptions::default())
        .unwrap();
    let run = deck.wait_for_run(&run_id, Duration::from_secs(60)).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let page = deck.poll(&run_id, 0).unwrap();
    let gap = page.gap.expect("expected a gap");
    assert_eq!(gap.from, 0);
    assert!(gap.to > 0);
    assert!(page.events.is_empty());
    assert!(page.dropped_events > 0);
    assert_eq!(page.next_cursor, gap.to);

    let resumed = deck.poll(&run_id, page.next_cursor).unwrap();
    assert!(resumed.gap.is_none());
    assert!(!resumed.events.is_empty() && resumed.events.len() <= 2500);
    assert_eq!(resumed.events[0].seq, gap.to);
    assert_eq!(resumed.events.last().unwrap().seq + 1, run.next_seq);
    assert_eq!(page.dropped_events, gap.to);
    assert!(resumed.done);
}

#[tokio::test]
async fn test_abort_escalates_past_ignored_sigterm() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let window = deck.create_window(NewWindow::named("stubborn")).unwrap();

    let exe = stub("trap '' TERM; sleep 5");
    let run_id = deck
        .start_run(&window.id, "", &exe, &RunOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    deck.abort_run(&run_id).unwrap();
    assert_eq!(deck.get_run(&run_id).unwrap().status, RunStatus::Aborting);
    assert_eq!(
        deck.get_window(&window.id).unwrap().status,
        WindowStatus::Aborting
    );
    // Repeating the request changes nothing
    deck.abort_run(&window.id).unwrap();

    let run = deck.wait_for_run(&run_id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run.finished_at.is_some());
    let window = deck.get_window(&window.id).unwrap();
    assert_eq!(window.status, WindowStatus::Idle);
    assert!(window.active_run_id.is_empty());

    let statuses: Vec<String> = deck
        .poll(&run_id, 0)
        .unwrap()
        .events
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Status { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec!["running", "aborting", "aborted"]);
}

#[tokio::test]
async fn test_missing_executable_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let window = deck.create_window(NewWindow::named("broken")).unwrap();
    let exe = ExecutableRef::new("/nonexistent/agentdeck-agent");

    let run_id = deck
        .start_run(&window.id, "hi", &exe, &RunOptions::default())
        .unwrap();
    let run = deck.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("/nonexistent/agentdeck-agent"));
    assert_eq!(deck.get_window(&window.id).unwrap().status, WindowStatus::Idle);
}

#[tokio::test]
async fn test_malformed_output_is_kept_raw() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let window = deck.create_window(NewWindow::named("raw")).unwrap();
    let exe = stub("echo 'not json'; echo; echo '   '; echo oops >&2; exit 3");

    let run_id = deck
        .start_run(&window.id, "x", &exe, &RunOptions::default())
        .unwrap();
    let pages = poll_until_done(&deck, &run_id).await;
    let kinds: Vec<&EventKind> = pages.iter().flat_map(|p| &p.events).map(|e| &e.kind).collect();
    let raw: Vec<_> = kinds
        .iter()
        .filter(|k| matches!(k, EventKind::Raw { .. }))
        .collect();
    assert_eq!(raw.len(), 1, "blank lines are not agent output: {raw:?}");
    assert!(kinds.iter().any(|k| matches!(k, EventKind::Stderr { .. })));

    let run = deck.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.exit_code, Some(3));
}

#[tokio::test]
async fn test_latest_todo_list_is_published_and_restored() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let window = deck.create_window(NewWindow::named("plan")).unwrap();

    let exe = stub(concat!(
        r#"echo '{"type":"item.started","item":{"id":"todo-1","type":"todo_list","items":[{"text":"a"},{"text":"b"}]}}'; "#,
        r#"echo '{"type":"item.updated","item":{"id":"todo-1","type":"todo_list","items":[{"text":"c","completed":true}]}}'"#,
    ));
    let run_id = deck
        .start_run(&window.id, "plan it", &exe, &RunOptions::default())
        .unwrap();
    let run = deck.wait_for_run(&run_id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let expected = vec![TodoItem {
        text: "c".into(),
        completed: true,
    }];
    assert_eq!(run.todo_list, expected);
    let current = deck.get_window(&window.id).unwrap();
    assert_eq!(current.todo_list, expected);
    assert_eq!(current.todo_list_id.as_deref(), Some("todo-1"));

    let mut snapshot = deck.snapshot();
    assert_eq!(snapshot.window_tasks[&window.id].todo_list, expected);
    assert_eq!(
        snapshot.window_tasks[&window.id].todo_list_id.as_deref(),
        Some("todo-1")
    );

    // Only windowTasks carries the list into the next process
    for w in &mut snapshot.windows {
        w.todo_list.clear();
        w.todo_list_id = None;
    }
    deck.flush();
    let shared = SharedDir::new(dir.path());
    atomic::write_json(&shared.state_path(), &snapshot).unwrap();

    let reopened = open(&dir);
    let restored = reopened.get_window(&window.id).unwrap();
    assert_eq!(restored.todo_list, expected);
    assert_eq!(restored.todo_list_id.as_deref(), Some("todo-1"));
}

// ============================================
// Request queue
// ============================================

#[tokio::test]
async fn test_queued_window_is_created_and_removed() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let queue = RequestQueue::new(deck.dir());
    queue.append_window(queued_window("w9")).unwrap();

    let report = deck.reconcile_requests().unwrap();
    assert_eq!(report.windows_created, 1);

    let window = deck.get_window("w9").unwrap();
    assert_eq!(window.name, "auto");
    assert_eq!(
        window.default_run_options.working_directory.as_deref(),
        Some("/tmp")
    );
    assert_eq!(window.default_run_options.sandbox_mode.as_deref(), Some("x"));
    assert!(queue.pending().unwrap().is_empty());
}

#[tokio::test]
async fn test_reapplying_requests_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let queue = RequestQueue::new(deck.dir());

    queue.append_window(queued_window("w1")).unwrap();
    deck.reconcile_requests().unwrap();
    let once = deck.get_window("w1").unwrap();

    queue.append_window(queued_window("w1")).unwrap();
    let report = deck.reconcile_requests().unwrap();
    assert_eq!(report.windows_created + report.windows_updated, 0);
    assert_eq!(deck.get_window("w1").unwrap(), once);

    let run = StartRunRequest {
        id: "r1".into(),
        window_id: "w1".into(),
        input: "go".into(),
        options: RunOptions::default(),
        task_id: None,
        created_at: Utc::now(),
    };
    queue.append_run(run.clone()).unwrap();
    assert_eq!(deck.reconcile_requests().unwrap().runs_started, 1);
    let started = deck.list_runs("w1").unwrap();
    assert_eq!(started.len(), 1);
    deck.wait_for_run(&started[0].id, Duration::from_secs(10))
        .await
        .unwrap();

    queue.append_run(run).unwrap();
    let report = deck.reconcile_requests().unwrap();
    assert_eq!(report.runs_started, 0);
    assert_eq!(deck.list_runs("w1").unwrap().len(), 1);
    assert!(queue.pending().unwrap().is_empty());
}

#[tokio::test]
async fn test_queued_run_waits_for_busy_window() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let queue = RequestQueue::new(deck.dir());
    let window = deck.create_window(NewWindow::named("busy")).unwrap();
    let first = deck
        .start_run(&window.id, "a", &stub("sleep 0.5"), &RunOptions::default())
        .unwrap();

    queue
        .append_run(StartRunRequest {
            id: "r2".into(),
            window_id: window.id.clone(),
            input: "b".into(),
            options: RunOptions::default(),
            task_id: Some("task-1".into()),
            created_at: Utc::now(),
        })
        .unwrap();
    let report = deck.reconcile_requests().unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(queue.pending().unwrap().start_runs.len(), 1);

    deck.wait_for_run(&first, Duration::from_secs(10)).await.unwrap();
    let report = deck.reconcile_requests().unwrap();
    assert_eq!(report.runs_started, 1);

    let task = deck.get_task("task-1").unwrap();
    assert!(matches!(
        task.status,
        TaskStatus::Running | TaskStatus::Completed
    ));
    let run_id = task.run_id.expect("task bound to its run");
    deck.wait_for_run(&run_id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(deck.get_task("task-1").unwrap().status, TaskStatus::Completed);
}

// ============================================
// Tasks
// ============================================

#[tokio::test]
async fn test_unstarted_task_times_out() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    deck.register_task("t1", "summarize", Some("/tmp"), None)
        .unwrap();

    let queued_timeout = deck.config().tasks.queued_timeout_secs as i64;
    let later = Utc::now() + chrono::Duration::seconds(queued_timeout + 1);
    let fired = deck.check_timeouts(later);
    assert_eq!(fired.len(), 1);

    let task = deck.get_task("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("timed out while queued"));
}

// ============================================
// Persistence
// ============================================

#[tokio::test]
async fn test_restart_releases_running_window() {
    let dir = TempDir::new().unwrap();
    let first = open(&dir);
    let window = first.create_window(NewWindow::named("long")).unwrap();
    let run_id = first
        .start_run(&window.id, "x", &stub("sleep 30"), &RunOptions::default())
        .unwrap();
    first.flush();

    let second = open(&dir);
    let restored = second.get_window(&window.id).unwrap();
    assert_eq!(restored.status, WindowStatus::Idle);
    assert!(restored.active_run_id.is_empty());
    assert!(second.active_runs().is_empty());

    let run = second.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("restarted"));

    first.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_view_polls_persisted_events() {
    let dir = TempDir::new().unwrap();
    let deck = open(&dir);
    let window = deck.create_window(NewWindow::named("view")).unwrap();
    let exe = stub(r#"echo '{"type":"thread.started","thread_id":"t-9"}'"#);
    let run_id = deck
        .start_run(&window.id, "x", &exe, &RunOptions::default())
        .unwrap();
    deck.wait_for_run(&run_id, Duration::from_secs(10)).await.unwrap();
    deck.flush();

    let view = SnapshotView::load(&SharedDir::new(dir.path())).unwrap();
    assert_eq!(view.windows().len(), 1);
    assert_eq!(view.windows()[0].thread_id, "t-9");

    let page = view.poll(&run_id, 0).unwrap();
    assert!(page.done);
    assert!(page.gap.is_none());
    assert_eq!(page.next_cursor, deck.get_run(&run_id).unwrap().next_seq);
    assert_eq!(page.events.len() as u64, page.next_cursor);
}

// ============================================
// Jobs
// ============================================

#[tokio::test]
async fn test_job_output_and_result() {
    let dir = TempDir::new().unwrap();
    let shared = SharedDir::new(dir.path());
    let jobs = JobStore::open(&shared, &test_config()).unwrap();

    let script = r#"cat; echo '{"type":"thread.started","thread_id":"job-thread"}'; echo warn >&2"#;
    let id = jobs
        .start_job(
            &ExecutableRef::new("sh"),
            &["-c".to_string(), script.to_string()],
            Some("from stdin\n"),
            JobLink::default(),
        )
        .unwrap();

    let record = jobs.wait_for_job(&id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(record.status, JobStatus::Finished);
    assert_eq!(record.exit_code, Some(0));
    assert!(record.stdout.contains("from stdin"));
    assert_eq!(record.stderr, "warn\n");
    assert_eq!(record.thread_id.as_deref(), Some("job-thread"));
    assert!(jobs.get_job_result(&id).is_ok());
}

#[tokio::test]
async fn test_job_cancel_and_still_running() {
    let dir = TempDir::new().unwrap();
    let shared = SharedDir::new(dir.path());
    let jobs = JobStore::open(&shared, &test_config()).unwrap();

    let id = jobs
        .start_job(
            &ExecutableRef::new("sh"),
            &["-c".to_string(), "trap '' TERM; sleep 5".to_string()],
            None,
            JobLink::default(),
        )
        .unwrap();

    let err = jobs.get_job_result(&id).unwrap_err();
    assert!(err.is_retryable());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(jobs.cancel_job(&id).unwrap().status, JobStatus::Aborting);
    assert_eq!(jobs.cancel_job(&id).unwrap().status, JobStatus::Aborting);

    let record = jobs.wait_for_job(&id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(record.status, JobStatus::Aborted);
    assert!(record.signal.is_some());
    assert!(jobs.cancel_job("missing").is_err());
}

#[tokio::test]
async fn test_job_heartbeat_advances_only_while_active() {
    let dir = TempDir::new().unwrap();
    let shared = SharedDir::new(dir.path());
    let mut config = test_config();
    config.jobs.heartbeat_secs = 1;
    let jobs = JobStore::open(&shared, &config).unwrap();

    let id = jobs
        .start_job(
            &ExecutableRef::new("sh"),
            &["-c".to_string(), "sleep 2.5".to_string()],
            None,
            JobLink::default(),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1600)).await;
    let running = jobs.get_job(&id).unwrap();
    assert_eq!(running.status, JobStatus::Running);
    let beat = running.last_heartbeat_at.expect("heartbeat recorded");
    assert!(beat > running.started_at, "{beat} <= {}", running.started_at);

    let finished = jobs.wait_for_job(&id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(finished.status, JobStatus::Finished);
    let last_beat = finished.last_heartbeat_at;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(jobs.get_job(&id).unwrap().last_heartbeat_at, last_beat);
}
