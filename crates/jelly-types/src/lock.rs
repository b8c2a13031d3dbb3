//! The on-disk lock record establishing daemon singleton identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of `agent.lock.json`.
///
/// The pid is the authoritative field; the rest is startup metadata for
/// humans and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Owning process id.
    pub pid: u32,
    /// When the owner started.
    pub started_at: DateTime<Utc>,
    /// Hostname the owner started on.
    pub hostname: String,
    /// Multiplexer session the owner was started from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zellij_session: Option<String>,
    /// Working directory the owner was started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl LockRecord {
    /// Build a record for the current process.
    pub fn for_current_process(zellij_session: Option<String>) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            hostname: hostname(),
            zellij_session,
            cwd: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
        }
    }
}

/// Best-effort hostname lookup.
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into())
}
