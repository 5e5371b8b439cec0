use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use notesync::conflict::conflict_path;
use notesync::engine::Engine;
use notesync::git::GitEngine;
use notesync::lifecycle::Lifecycle;
use notesync::notifier::Notifier;
use notesync::repo::{DefaultDestinationFactory, InMemoryRepo};
use notesync::stats::StatsAggregator;
use notesync_progress::ProgressReporter;

#[derive(Parser, Debug)]
#[command(name = "notesync", version)]
#[command(about = "Vault backup/sync/git-mirror engine")]
struct Cli {
    /// Directory workspaces (archives, clones) are staged under.
    #[arg(long, default_value = "notesync-workspace", global = true)]
    workspace_dir: PathBuf,

    /// How often the backup scheduler checks for due configs.
    #[arg(long, default_value = "1m", global = true)]
    backup_tick_interval: String,

    /// How often the stats aggregator flushes buffered view counts.
    #[arg(long, default_value = "5m", global = true)]
    stats_flush_interval: String,

    /// How long shutdown waits for background work to drain.
    #[arg(long, default_value = "30s", global = true)]
    shutdown_timeout: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine (backup scheduler, git mirror, stats flush) until interrupted.
    Serve,
    /// Print environment diagnostics (git binary, workspace writability).
    Doctor,
    /// Print the conflict-copy path that would be generated for a note edit.
    ConflictPath {
        /// Original note path, e.g. `notes/test.md`.
        path: String,
        /// Timestamp to stamp the conflict copy with (RFC 3339). Defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Generate shell completion scripts.
    Completions { shell: Shell },
}

fn parse_duration(s: &str) -> Result<Duration> {
    notesync_duration::deserialize_duration(serde_json::Value::String(s.to_string()))
        .map_err(|e| anyhow::anyhow!("invalid duration {s:?}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    match &cli.cmd {
        Commands::Serve => run_serve(&cli).await,
        Commands::Doctor => run_doctor(&cli),
        Commands::ConflictPath { path, at } => {
            let ts = at.unwrap_or_else(Utc::now);
            println!("{}", conflict_path(path, ts));
            Ok(())
        }
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "notesync", &mut io::stdout());
            Ok(())
        }
    }
}

/// Wires the engine against the in-process repository and runs it until
/// `Ctrl+C`, then drives the shutdown sequence (spec.md §4.10). The
/// in-memory repository is the only concrete [`notesync::repo`]
/// implementation this workspace ships; an embedder wiring a real
/// datastore would swap it here and nowhere else, since every engine type
/// is constructed against the repository traits, not this struct.
async fn run_serve(cli: &Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.workspace_dir).with_context(|| format!("creating {}", cli.workspace_dir.display()))?;

    let backup_tick_interval = parse_duration(&cli.backup_tick_interval)?;
    let stats_flush_interval = parse_duration(&cli.stats_flush_interval)?;
    let shutdown_timeout = parse_duration(&cli.shutdown_timeout)?;

    let repo = Arc::new(InMemoryRepo::new());
    let engine = Arc::new(Engine::new(
        repo.clone(),
        repo.clone(),
        repo.clone(),
        repo.clone(),
        repo.clone(),
        Arc::new(DefaultDestinationFactory),
        cli.workspace_dir.join("backups"),
    ));
    let git = Arc::new(GitEngine::new(repo.clone(), repo.clone(), repo.clone(), cli.workspace_dir.join("git-mirrors")));
    let notifier = Arc::new(Notifier::new(engine.clone(), git, repo.clone()));

    let (_pipeline, history_worker) = notesync::history::HistoryPipeline::new(repo.clone(), repo.clone(), 10);
    let stats = Arc::new(StatsAggregator::new(repo));

    let lifecycle = Lifecycle::start(engine, history_worker, notifier, stats, backup_tick_interval, stats_flush_interval);

    tracing::info!(workspace_dir = %cli.workspace_dir.display(), "notesync engine started, waiting for Ctrl+C");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    match lifecycle.shutdown(shutdown_timeout).await {
        Ok(()) => {
            tracing::info!("shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "shutdown did not drain within the timeout");
            Err(e.into())
        }
    }
}

fn run_doctor(cli: &Cli) -> Result<()> {
    let mut progress = ProgressReporter::new(2);

    progress.set_step(1, "checking git binary");
    print_cmd_version("git");
    progress.finish_step();

    progress.set_step(2, "checking workspace directory");
    match std::fs::create_dir_all(&cli.workspace_dir) {
        Ok(()) => println!("workspace_dir: {} (writable)", cli.workspace_dir.display()),
        Err(e) => println!("workspace_dir: {} (NOT writable: {e})", cli.workspace_dir.display()),
    }
    progress.finish_step();

    progress.finish();
    Ok(())
}

fn print_cmd_version(cmd: &str) {
    match Command::new(cmd).arg("--version").output() {
        Ok(o) if o.status.success() => {
            let s = String::from_utf8_lossy(&o.stdout).trim().to_string();
            println!("{cmd}: {s}");
        }
        Ok(o) => println!("{cmd}: --version failed: {}", String::from_utf8_lossy(&o.stderr).trim()),
        Err(e) => println!("{cmd}: not found ({e})"),
    }
}
