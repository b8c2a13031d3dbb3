//! Startup supervisor: make sure a healthy daemon exists, then hand off
//! to the UI.
//!
//! "Socket file exists" proves nothing; health means completing a
//! `register_client` + `ping` round-trip. An owner that holds the lock but
//! cannot answer the probe is signaled away before a fresh daemon is
//! spawned, detached, with a marker variable and its stdio routed to a log
//! file.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, warn};

use jelly_daemon::lockfile;
use jelly_proto::ProbeClient;
use jelly_types::paths;

/// Per-attempt probe deadline.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Probe attempts before concluding no daemon answers.
const PROBE_ATTEMPTS: u32 = 2;

/// Total budget for a spawned daemon to become healthy.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period after SIGTERM before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Probe for a daemon, replacing an unresponsive one and spawning a fresh
/// one if needed. Returns once a healthy daemon answers.
pub fn ensure_daemon() -> anyhow::Result<()> {
    let state_dir = paths::state_dir();
    let probe = ProbeClient::new(paths::socket_path(&state_dir));

    if probe_healthy(&probe) {
        return Ok(());
    }

    // The lock may name an owner that exists but no longer answers; get it
    // out of the way before spawning.
    if let Some(owner) = lockfile::read_owner(&paths::lock_path(&state_dir)) {
        if lockfile::is_process_alive(owner.pid) {
            warn!(owner_pid = owner.pid, "daemon unresponsive; replacing it");
            terminate(owner.pid);
        }
    }

    spawn_daemon(&state_dir)?;
    wait_until_healthy(&probe)
}

fn probe_healthy(probe: &ProbeClient) -> bool {
    for attempt in 0..PROBE_ATTEMPTS {
        if probe.is_healthy(PROBE_TIMEOUT) {
            return true;
        }
        if attempt + 1 < PROBE_ATTEMPTS {
            std::thread::sleep(Duration::from_millis(150));
        }
    }
    false
}

/// SIGTERM with a bounded wait, then SIGKILL.
fn terminate(pid: u32) {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return;
    };
    let target = nix::unistd::Pid::from_raw(raw_pid);

    let _ = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGTERM);
    if wait_for_exit(pid, TERM_GRACE) {
        return;
    }

    warn!(pid, "daemon ignored SIGTERM; escalating");
    let _ = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGKILL);
    wait_for_exit(pid, Duration::from_secs(2));
}

fn wait_for_exit(pid: u32, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if !lockfile::is_process_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    !lockfile::is_process_alive(pid)
}

/// Spawn a detached daemon child: marker env var, no inherited stdio, its
/// own process group so it survives this terminal.
fn spawn_daemon(state_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("cannot create state dir {}", state_dir.display()))?;

    let binary = std::env::current_exe().context("cannot locate own binary")?;
    let log_path = state_dir.join("daemon.log");
    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let stderr = stdout.try_clone()?;

    let child = std::process::Command::new(&binary)
        .arg("daemon")
        .env(paths::DAEMON_MARKER_ENV, "1")
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()
        .with_context(|| format!("failed to spawn daemon from {}", binary.display()))?;

    info!(pid = child.id(), log = %log_path.display(), "daemon spawned");
    Ok(())
}

/// Poll the probe until the spawned daemon answers or the budget runs out.
fn wait_until_healthy(probe: &ProbeClient) -> anyhow::Result<()> {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    let mut last_error = String::from("daemon never answered");

    while Instant::now() < deadline {
        match probe.probe(PROBE_TIMEOUT) {
            Ok(pid) => {
                info!(daemon_pid = pid, "daemon healthy");
                return Ok(());
            }
            Err(e) => last_error = e.to_string(),
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    anyhow::bail!(
        "daemon did not become healthy within {}s (last probe error: {last_error}); \
         check {} for details",
        STARTUP_TIMEOUT.as_secs(),
        paths::state_dir().join("daemon.log").display()
    )
}
