//! jelly-j -- terminal-workspace assistant.
//!
//! Invocation surface:
//! - no subcommand: probe for a daemon, spawn one if needed, then run the
//!   UI client in the foreground
//! - `daemon`: run the daemon directly; does not exit until terminated
//! - `ui`: run only the UI client, assuming a daemon is already present

mod supervisor;
mod ui;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jelly_daemon::{ClaudeRuntime, DaemonConfig, DaemonRuntime, RunExit};
use jelly_types::paths;

#[derive(Parser, Debug)]
#[command(name = "jelly-j", version, about)]
struct Cli {
    /// Increase logging verbosity (RUST_LOG=debug)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground until terminated
    Daemon,
    /// Run only the UI client against an existing daemon
    Ui,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let daemon_mode = matches!(cli.command, Some(Commands::Daemon));
    init_tracing(&cli, daemon_mode)?;

    match cli.command {
        Some(Commands::Daemon) => run_daemon(),
        Some(Commands::Ui) => run_ui(),
        None => {
            supervisor::ensure_daemon()?;
            run_ui()
        }
    }
}

/// Initialize tracing from the CLI flags. In daemon mode with
/// `JELLY_J_DAEMON_TRACE=1`, logs go to a trace file in the state
/// directory instead of the (detached) stderr.
fn init_tracing(cli: &Cli, daemon_mode: bool) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if daemon_mode && paths::trace_enabled() {
        let state_dir = paths::state_dir();
        std::fs::create_dir_all(&state_dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths::trace_log_path(&state_dir))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
    Ok(())
}

/// Run the daemon until SIGTERM/SIGINT. A lock held by a live daemon is
/// success: the singleton already exists.
fn run_daemon() -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })?;

    // The daemon is a single-threaded cooperative scheduler; every
    // subprocess and socket read is a yield point, not a thread.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let config = DaemonConfig::from_env();
    let runtime = Arc::new(ClaudeRuntime::new());
    let exit = rt.block_on(DaemonRuntime::new(config, runtime).run(shutdown_rx))?;

    if exit == RunExit::AlreadyRunning {
        println!("jelly-j daemon is already running.");
    }
    Ok(())
}

fn run_ui() -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(ui::run())
}
