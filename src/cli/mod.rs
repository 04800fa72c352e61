//! Command-line interface for rss-agent.
//!
//! Provides commands for serving the dashboard API, running reports in the
//! foreground, and inspecting or pruning run history.

use std::fs::{File, OpenOptions};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fs2::FileExt;
use tracing::{info, warn};

use crate::api::{self, ApiContext};
use crate::config::{config, ResolvedConfig};
use crate::core::{RunOrchestrator, RunStore, Subscription};
use crate::domain::{Run, RunMode, RunOptions, RunStatus, StreamEvent};

/// rss-agent - Run orchestrator for the RSS report pipeline
#[derive(Parser, Debug)]
#[command(name = "rss-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the dashboard HTTP API
    Serve {
        /// Address to bind to (overrides server.host)
        #[arg(long, env = "RSS_AGENT_HOST")]
        host: Option<String>,

        /// Port to listen on (overrides server.port)
        #[arg(short, long, env = "RSS_AGENT_PORT")]
        port: Option<u16>,
    },

    /// Run a report in the foreground and follow its output
    Run {
        /// Report mode
        #[arg(value_enum)]
        mode: ModeArg,

        /// Skip the AI step
        #[arg(long)]
        dry_run: bool,

        /// Pipeline config (daily mode)
        #[arg(long)]
        config: Option<String>,

        /// Pipeline config (weekly mode)
        #[arg(long)]
        weekly_config: Option<String>,

        /// Cap on articles sent to the AI step (daily mode)
        #[arg(long)]
        max_articles: Option<u32>,

        /// Look-back window in hours (daily mode)
        #[arg(long)]
        hours: Option<u32>,

        /// Extra arguments passed through to the pipeline (after `--`)
        #[arg(last = true)]
        extra_args: Vec<String>,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show one run
    Status {
        run_id: i64,
    },

    /// Print a run's log
    Logs {
        run_id: i64,

        /// Only entries after this log id
        #[arg(long, default_value = "0")]
        after_id: i64,

        /// Maximum number of entries
        #[arg(short, long, default_value = "500")]
        limit: usize,
    },

    /// Run again with the options of an earlier run
    Rerun {
        run_id: i64,
    },

    /// Delete a finished run
    Delete {
        run_id: i64,

        /// Also remove the report file
        #[arg(long)]
        delete_artifact: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Report mode for CLI (maps to RunMode)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    /// Daily digest
    #[value(alias = "standard")]
    Daily,

    /// Weekly report
    Weekly,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Daily => RunMode::Daily,
            ModeArg::Weekly => RunMode::Weekly,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { host, port } => serve(host, port).await,
            Commands::Run {
                mode,
                dry_run,
                config,
                weekly_config,
                max_articles,
                hours,
                extra_args,
            } => {
                let mut options = RunOptions {
                    dry_run,
                    max_articles,
                    hours,
                    extra_args,
                    ..RunOptions::default()
                };
                if let Some(path) = config {
                    options.config_path = path;
                }
                if let Some(path) = weekly_config {
                    options.weekly_config_path = path;
                }
                run_foreground(RunSource::New(mode.into(), options)).await
            }
            Commands::Runs { limit } => list_runs(limit),
            Commands::Status { run_id } => show_status(run_id),
            Commands::Logs {
                run_id,
                after_id,
                limit,
            } => show_logs(run_id, after_id, limit),
            Commands::Rerun { run_id } => run_foreground(RunSource::Rerun(run_id)).await,
            Commands::Delete {
                run_id,
                delete_artifact,
            } => delete_run(run_id, delete_artifact),
            Commands::Config => show_config(),
        }
    }
}

/// Take the service lock; only one process may drive runs at a time
fn acquire_lock(cfg: &ResolvedConfig) -> Result<File> {
    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create {}", cfg.home.display()))?;

    let path = cfg.lock_path();
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

    file.try_lock_exclusive().with_context(|| {
        format!(
            "Another rss-agent process holds {}; use its API instead",
            path.display()
        )
    })?;

    Ok(file)
}

fn open_store(cfg: &ResolvedConfig) -> Result<RunStore> {
    RunStore::open(&cfg.database)
        .with_context(|| format!("Failed to open run database: {}", cfg.database.display()))
}

fn open_orchestrator(cfg: &ResolvedConfig) -> Result<RunOrchestrator> {
    let store = Arc::new(open_store(cfg)?);
    let executor = Arc::new(cfg.command_executor());
    RunOrchestrator::new(store, executor, cfg.orchestrator_settings())
        .context("Failed to initialise orchestrator")
}

async fn serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let cfg = config()?;
    let _lock = acquire_lock(cfg)?;
    let orchestrator = open_orchestrator(cfg)?;

    let host = host.unwrap_or_else(|| cfg.server.host.clone());
    let port = port.unwrap_or(cfg.server.port);
    let addr = format!("{}:{}", host, port);

    let executor = orchestrator.executor_name().to_string();
    let app = api::router(Arc::new(ApiContext::new(orchestrator)));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {}", addr))?;

    info!(
        addr = %addr,
        project_root = %cfg.project_root.display(),
        database = %cfg.database.display(),
        executor = %executor,
        "Listening for connections"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

enum RunSource {
    New(RunMode, RunOptions),
    Rerun(i64),
}

async fn run_foreground(source: RunSource) -> Result<()> {
    let cfg = config()?;
    let _lock = acquire_lock(cfg)?;
    let orchestrator = open_orchestrator(cfg)?;

    let run_id = match source {
        RunSource::New(mode, options) => orchestrator.start_run(mode, options)?,
        RunSource::Rerun(source_id) => orchestrator.rerun(source_id)?,
    };
    eprintln!("[Run {} started, Ctrl+C to cancel]", run_id);

    let Some(status) = follow_to_end(&orchestrator, run_id).await? else {
        anyhow::bail!("Run {} was deleted while running", run_id);
    };
    let run = orchestrator.get_run(run_id)?;

    match status {
        RunStatus::Success => {
            eprintln!("\n[Run {} completed successfully]", run_id);
            if let Some(path) = run.output_path {
                println!("{}", path);
            }
            Ok(())
        }
        RunStatus::Cancelled => {
            eprintln!("\n[Run {} cancelled]", run_id);
            Ok(())
        }
        _ => anyhow::bail!(
            "Run {} failed: {}",
            run_id,
            run.error_message.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// How a followed stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowEnd {
    Finished(RunStatus),
    Deleted,
    /// The stream closed before `done` or `deleted`
    Disconnected,
}

/// What has been printed so far, carried across resubscriptions
#[derive(Debug, Default)]
struct FollowState {
    last_log_id: i64,
    last_step: String,
    cancel_requested: bool,
}

impl FollowState {
    /// True the first time a log id is seen
    fn accept_log(&mut self, id: i64) -> bool {
        if id <= self.last_log_id {
            return false;
        }
        self.last_log_id = id;
        true
    }
}

/// Follow a run to its final status, resubscribing when a stream closes
/// early. `None` means the run was deleted.
async fn follow_to_end(orchestrator: &RunOrchestrator, run_id: i64) -> Result<Option<RunStatus>> {
    let mut state = FollowState::default();

    loop {
        let subscription = orchestrator.subscribe(run_id)?;
        match follow(orchestrator, run_id, subscription, &mut state).await {
            FollowEnd::Disconnected => {
                let run = orchestrator.get_run(run_id)?;
                if run.status.is_terminal() {
                    return Ok(Some(run.status));
                }
                warn!(run_id, "Event stream closed early; resubscribing");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            FollowEnd::Finished(status) => return Ok(Some(status)),
            FollowEnd::Deleted => return Ok(None),
        }
    }
}

/// Print a run's stream until it ends; Ctrl+C requests cancellation
async fn follow(
    orchestrator: &RunOrchestrator,
    run_id: i64,
    mut subscription: Subscription,
    state: &mut FollowState,
) -> FollowEnd {
    loop {
        let event = tokio::select! {
            event = subscription.next() => event,
            _ = tokio::signal::ctrl_c(), if !state.cancel_requested => {
                state.cancel_requested = true;
                eprintln!("\n[Cancelling run {}...]", run_id);
                if let Err(e) = orchestrator.cancel_run(run_id) {
                    eprintln!("[Cancel failed: {}]", e);
                }
                continue;
            }
        };

        let Some(event) = event else {
            return FollowEnd::Disconnected;
        };

        match event {
            StreamEvent::Log(entry) => {
                if state.accept_log(entry.id) {
                    println!("[{}] {}: {}", entry.level, entry.module, entry.message)
                }
            }
            StreamEvent::Run(run) => {
                if run.current_step != state.last_step {
                    eprintln!("[{:>3}%] {}", run.progress, run.current_step);
                    state.last_step = run.current_step;
                }
            }
            StreamEvent::Done(done) => return FollowEnd::Finished(done.status),
            StreamEvent::Deleted(_) => return FollowEnd::Deleted,
        }
    }
}

fn list_runs(limit: usize) -> Result<()> {
    let store = open_store(config()?)?;
    let runs = store.list_runs(limit)?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<6} {:<7} {:<10} {:>5} {:<18} {:<20}",
        "ID", "MODE", "STATUS", "PROG", "STEP", "STARTED"
    );
    println!("{}", "-".repeat(72));

    for run in runs {
        println!(
            "{:<6} {:<7} {:<10} {:>4}% {:<18} {:<20}",
            run.id,
            run.mode,
            run.status,
            run.progress,
            truncate(&run.current_step, 18),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}~", cut)
    }
}

fn show_status(run_id: i64) -> Result<()> {
    let store = open_store(config()?)?;
    let run = store.get_run(run_id)?;
    print_run(&run)
}

fn print_run(run: &Run) -> Result<()> {
    println!("Run ID: {}", run.id);
    println!("Mode: {}", run.mode);
    println!("Status: {}", run.status);
    println!("Progress: {}% ({})", run.progress, run.current_step);
    println!("Started: {}", run.started_at);
    if let Some(ended) = run.ended_at {
        println!("Ended: {}", ended);
    }
    if let Some(seconds) = run.duration_seconds {
        println!("Duration: {:.1}s", seconds);
    }
    if let Some(ref path) = run.output_path {
        println!("Output: {}", path);
    }
    if let Some(ref error) = run.error_message {
        println!("Error: {}", error);
    }
    if run.options.dry_run {
        println!("Dry run: yes");
    }
    if !run.stats.is_empty() {
        let stats = serde_json::to_string_pretty(&run.stats).context("Failed to render stats")?;
        println!("\nStats:\n{}", stats);
    }

    Ok(())
}

fn show_logs(run_id: i64, after_id: i64, limit: usize) -> Result<()> {
    let store = open_store(config()?)?;
    store.get_run(run_id)?;

    for entry in store.list_logs(run_id, after_id, limit)? {
        println!(
            "{:>6} {} [{}] {}: {}",
            entry.id,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.level,
            entry.module,
            entry.message
        );
    }

    Ok(())
}

fn delete_run(run_id: i64, delete_artifact: bool) -> Result<()> {
    let cfg = config()?;
    let _lock = acquire_lock(cfg)?;
    let orchestrator = open_orchestrator(cfg)?;

    let outcome = orchestrator.delete_run(run_id, delete_artifact)?;
    println!("Deleted run {}", run_id);
    if delete_artifact {
        println!(
            "Artifact: {}",
            if outcome.artifact_deleted {
                "removed"
            } else {
                "not removed"
            }
        );
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config()?;

    println!("rss-agent configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();

    let rendered = serde_yaml::to_string(cfg).context("Failed to render configuration")?;
    print!("{}", rendered);

    Ok(())
}
