//! agentdeck-request - append requests to a data directory's queue
//!
//! A producer never touches `state.json`. It appends entries to
//! `requests.json` under the queue lock and exits; whichever process owns the
//! directory applies them on its next reconciliation.

mod data_dir;

use agentdeck_core::queue::{CreateWindowRequest, StartRunRequest};
use agentdeck_core::{Config, RequestQueue, RunOptions};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use data_dir::DirArgs;

#[derive(Parser)]
#[command(name = "agentdeck-request")]
#[command(about = "Queue window and run requests for the owning agentdeck process")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    dirs: DirArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a window with a known id, or update its defaults
    Window {
        #[arg(long)]
        id: String,

        #[arg(long, default_value = "")]
        name: String,

        /// Working directory for the window's runs
        #[arg(long)]
        cwd: String,

        /// Sandbox mode (read-only, workspace-write, ...)
        #[arg(long)]
        sandbox: String,

        #[arg(long)]
        model: Option<String>,

        /// Resume this external thread
        #[arg(long)]
        thread: Option<String>,
    },

    /// Start a run on a window once it is idle
    Run {
        #[arg(long)]
        window: String,

        /// Prompt written to the agent's stdin
        #[arg(long)]
        input: String,

        /// Automation task to bind to the run
        #[arg(long)]
        task: Option<String>,

        /// Per-run working directory override
        #[arg(long)]
        cwd: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("failed to load configuration")?;
    let _log_guard =
        agentdeck_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let dir = cli.dirs.resolve();
    dir.ensure()
        .with_context(|| format!("failed to create {}", dir.root().display()))?;
    let queue = RequestQueue::new(&dir);
    let now = chrono::Utc::now();

    let id = match cli.command {
        Command::Window {
            id,
            name,
            cwd,
            sandbox,
            model,
            thread,
        } => {
            let request = CreateWindowRequest {
                id: id.clone(),
                name,
                defaults: RunOptions {
                    model,
                    sandbox_mode: Some(sandbox),
                    working_directory: Some(cwd),
                    ..Default::default()
                },
                thread_id: thread,
                created_at: now,
            };
            queue
                .append_window(request)
                .context("failed to queue window request")?;
            tracing::info!(window_id = %id, "Queued create-window request");
            id
        }
        Command::Run {
            window,
            input,
            task,
            cwd,
        } => {
            let id = uuid::Uuid::new_v4().to_string();
            let request = StartRunRequest {
                id: id.clone(),
                window_id: window.clone(),
                input,
                options: RunOptions {
                    working_directory: cwd,
                    ..Default::default()
                },
                task_id: task,
                created_at: now,
            };
            queue
                .append_run(request)
                .context("failed to queue run request")?;
            tracing::info!(request_id = %id, window_id = %window, "Queued start-run request");
            id
        }
    };

    println!("{id}");
    Ok(())
}
