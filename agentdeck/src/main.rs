//! agentdeck - orchestrator host for long-running agent sessions
//!
//! `serve` owns a data directory: it drains the request queue, runs the task
//! timeout monitor and keeps `state.json` current. The other subcommands are
//! either an in-process frontend (`run`) or read-only views of the shared
//! files (`status`, `events`, `jobs`) that work while another process owns
//! the directory.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Data: $XDG_DATA_HOME/agentdeck/ (~/.local/share/agentdeck/)
//! - Logs: $XDG_STATE_HOME/agentdeck/agentdeck.log
//! - Config: $XDG_CONFIG_HOME/agentdeck/config.toml

mod data_dir;
mod owner_lock;

use agentdeck_core::jobs::JobsFile;
use agentdeck_core::{
    atomic, Config, NewWindow, RunOptions, RunStatus, SharedDir, SnapshotView, StoreRegistry,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use data_dir::DirArgs;
use owner_lock::acquire_owner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "agentdeck")]
#[command(about = "Orchestrate agent runs across cooperating processes")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    dirs: DirArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Own the data directory: apply queued requests until Ctrl+C
    Serve {
        /// Request queue poll interval in milliseconds
        #[arg(long, default_value = "500")]
        poll: u64,

        /// Drain the queue once, wait for the runs it started, then exit
        #[arg(long)]
        once: bool,
    },

    /// Create a window, run one prompt in it and stream its events
    Run {
        /// Window name
        #[arg(long)]
        name: Option<String>,

        /// Working directory for the agent
        #[arg(long)]
        cwd: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Sandbox mode (read-only, workspace-write, ...)
        #[arg(long)]
        sandbox: Option<String>,

        /// The prompt, written to the agent's stdin
        prompt: String,
    },

    /// Print the windows of the persisted snapshot as JSON
    Status,

    /// Poll the persisted events of a run
    Events {
        run_id: String,

        /// First sequence number wanted
        #[arg(long, default_value = "0")]
        cursor: u64,
    },

    /// Print the async job records as JSON
    Jobs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging (to file, stdout carries command output)
    let _log_guard =
        agentdeck_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let dir = cli.dirs.resolve();
    tracing::info!(dir = %dir.root().display(), "agentdeck starting");

    match cli.command {
        Command::Serve { poll, once } => serve(&dir, &config, Duration::from_millis(poll), once).await,
        Command::Run {
            name,
            cwd,
            model,
            sandbox,
            prompt,
        } => {
            let defaults = RunOptions {
                model,
                sandbox_mode: sandbox,
                working_directory: cwd,
                ..Default::default()
            };
            run_prompt(&dir, &config, name, defaults, &prompt).await
        }
        Command::Status => print_status(&dir),
        Command::Events { run_id, cursor } => print_events(&dir, &run_id, cursor),
        Command::Jobs => print_jobs(&dir),
    }
}

/// Set a flag on Ctrl+C.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;
    Ok(interrupted)
}

async fn serve(dir: &SharedDir, config: &Config, poll: Duration, once: bool) -> Result<()> {
    dir.ensure()
        .with_context(|| format!("failed to create {}", dir.root().display()))?;
    let _owner = acquire_owner(dir.root()).context("failed to acquire directory ownership")?;

    let registry = StoreRegistry::global();
    let store = registry
        .acquire(dir, config)
        .context("failed to open the store")?;
    let deck = store.orchestrator.clone();

    let cancel = CancellationToken::new();
    let check_interval = Duration::from_secs(config.tasks.check_interval_secs.max(1));
    let monitor = deck.spawn_timeout_monitor(check_interval, cancel.clone());

    let result = if once {
        serve_once(&deck).await
    } else {
        serve_loop(&deck, poll).await
    };

    cancel.cancel();
    let _ = monitor.await;
    registry.release(store).await;
    tracing::info!("agentdeck serve stopped");
    result
}

async fn serve_once(deck: &agentdeck_core::Orchestrator) -> Result<()> {
    let report = deck
        .reconcile_requests()
        .context("failed to apply the request queue")?;
    println!(
        "Applied: {} window(s) created, {} updated, {} run(s) started, {} pending",
        report.windows_created, report.windows_updated, report.runs_started, report.pending
    );
    let limit = Duration::from_secs(deck.config().tasks.running_timeout_secs.max(1));
    for run_id in deck.active_runs() {
        let run = deck.wait_for_run(&run_id, limit).await?;
        println!("run {} {}", run.id, run.status);
    }
    Ok(())
}

async fn serve_loop(deck: &agentdeck_core::Orchestrator, poll: Duration) -> Result<()> {
    let interrupted = interrupt_flag()?;
    println!(
        "Serving {} (poll every {}ms). Press Ctrl+C to stop.",
        deck.dir().root().display(),
        poll.as_millis()
    );

    while !interrupted.load(Ordering::SeqCst) {
        match deck.reconcile_requests() {
            Ok(report) if !report.is_empty() => {
                let timestamp = chrono::Local::now().format("%H:%M:%S");
                println!(
                    "[{}] {} window(s) created, {} updated, {} run(s) started, {} pending, {} dropped",
                    timestamp,
                    report.windows_created,
                    report.windows_updated,
                    report.runs_started,
                    report.pending,
                    report.dropped
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Request queue reconciliation failed"),
        }
        tokio::time::sleep(poll).await;
    }
    Ok(())
}

async fn run_prompt(
    dir: &SharedDir,
    config: &Config,
    name: Option<String>,
    defaults: RunOptions,
    prompt: &str,
) -> Result<()> {
    dir.ensure()
        .with_context(|| format!("failed to create {}", dir.root().display()))?;
    let _owner = acquire_owner(dir.root()).context("failed to acquire directory ownership")?;

    let registry = StoreRegistry::global();
    let store = registry
        .acquire(dir, config)
        .context("failed to open the store")?;
    let deck = store.orchestrator.clone();
    let interrupted = interrupt_flag()?;

    let result = stream_run(&deck, name, defaults, prompt, &interrupted).await;
    registry.release(store).await;
    result
}

async fn stream_run(
    deck: &agentdeck_core::Orchestrator,
    name: Option<String>,
    defaults: RunOptions,
    prompt: &str,
    interrupted: &AtomicBool,
) -> Result<()> {
    let window = deck.create_window(NewWindow {
        name,
        defaults,
        ..Default::default()
    })?;
    let exe = deck.executable().clone();
    let run_id = deck.start_run(&window.id, prompt, &exe, &RunOptions::default())?;
    tracing::info!(window_id = %window.id, run_id = %run_id, "Started run");

    let mut cursor = 0;
    let mut aborted = false;
    loop {
        if interrupted.load(Ordering::SeqCst) && !aborted {
            deck.abort_run(&run_id)?;
            aborted = true;
        }
        let page = deck.poll(&run_id, cursor)?;
        if let Some(gap) = &page.gap {
            eprintln!("(events {}..{} were dropped)", gap.from, gap.to);
        }
        for event in &page.events {
            println!("{}", serde_json::to_string(event)?);
        }
        cursor = page.next_cursor;
        if page.done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let run = deck.get_run(&run_id)?;
    println!("run {} {}", run.id, run.status);
    match run.status {
        RunStatus::Completed => Ok(()),
        status => anyhow::bail!(
            "run {} {}: {}",
            run.id,
            status,
            run.error.as_deref().unwrap_or("no error reported")
        ),
    }
}

fn print_status(dir: &SharedDir) -> Result<()> {
    let view = SnapshotView::load(dir).context("failed to read the state snapshot")?;
    println!("{}", serde_json::to_string_pretty(view.windows())?);
    Ok(())
}

fn print_events(dir: &SharedDir, run_id: &str, cursor: u64) -> Result<()> {
    let view = SnapshotView::load(dir).context("failed to read the state snapshot")?;
    let page = view
        .poll(run_id, cursor)
        .with_context(|| format!("failed to poll run {run_id}"))?;
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

fn print_jobs(dir: &SharedDir) -> Result<()> {
    let file: Option<JobsFile> =
        atomic::read_json(&dir.jobs_path()).context("failed to read the job store")?;
    let jobs = file.map(|f| f.jobs).unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}
