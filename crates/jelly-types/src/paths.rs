//! State directory layout.
//!
//! All daemon artifacts live under one directory (default `~/.jelly-j/`):
//! the singleton lock record, the listening socket, the persisted
//! conversation state, and the history journal. `JELLY_J_STATE_DIR`
//! relocates the whole set, which is how tests isolate themselves.

use std::path::PathBuf;

/// Environment variable that relocates the state directory.
pub const STATE_DIR_ENV: &str = "JELLY_J_STATE_DIR";

/// Environment variable that enables the daemon trace log.
pub const DAEMON_TRACE_ENV: &str = "JELLY_J_DAEMON_TRACE";

/// Marker variable set on the detached daemon child by the supervisor.
pub const DAEMON_MARKER_ENV: &str = "JELLY_J_DAEMON";

/// Resolve the state directory.
///
/// `JELLY_J_STATE_DIR` wins if set and non-empty; otherwise `$HOME/.jelly-j`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".jelly-j")
}

/// Path to the singleton lock record.
pub fn lock_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("agent.lock.json")
}

/// Path to the daemon's listening socket.
pub fn socket_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("daemon.sock")
}

/// Path to the persisted conversation state.
pub fn state_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("state.json")
}

/// Path to the append-only history journal.
pub fn history_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("history.jsonl")
}

/// Path to the daemon trace log.
pub fn trace_log_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("daemon.trace.log")
}

/// Path to the UI client's line-editor history.
pub fn ui_history_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("ui_history.txt")
}

/// Whether daemon tracing is enabled (`JELLY_J_DAEMON_TRACE=1`).
pub fn trace_enabled() -> bool {
    std::env::var(DAEMON_TRACE_ENV).map(|v| v == "1").unwrap_or(false)
}
