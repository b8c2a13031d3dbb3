//! Singleton lock: at most one live daemon per machine.
//!
//! The lock is an exclusively-created JSON file holding the owner's pid and
//! startup metadata. Staleness is decided by probing the owner pid; a probe
//! we cannot complete counts as alive, so two daemons can never both
//! believe they own the lock.

use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info, warn};

use jelly_types::{paths, JellyError, LockRecord};

/// Bounded attempts at reclaiming a stale lock before giving up.
const LOCK_RETRY_LIMIT: u32 = 3;

/// Result of a lock acquisition attempt.
#[derive(Debug)]
pub struct LockOutcome {
    /// Whether this process now owns the lock.
    pub acquired: bool,
    /// The current owner's record when not acquired.
    pub owner: Option<LockRecord>,
}

/// Attempt exclusive creation of the lock file under `state_dir`.
///
/// On `already-exists` the current owner is read; a live owner means not
/// acquired, a dead one is deleted and the attempt retried up to
/// [`LOCK_RETRY_LIMIT`] times.
pub fn acquire_lock(
    state_dir: &Path,
    zellij_session: Option<String>,
) -> Result<LockOutcome, JellyError> {
    std::fs::create_dir_all(state_dir)?;
    let path = paths::lock_path(state_dir);

    for attempt in 0..LOCK_RETRY_LIMIT {
        let record = LockRecord::for_current_process(zellij_session.clone());
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| JellyError::Fatal(format!("failed to serialize lock record: {e}")))?;

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(json.as_bytes())?;
                info!(pid = record.pid, path = %path.display(), "lock acquired");
                return Ok(LockOutcome {
                    acquired: true,
                    owner: Some(record),
                });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match read_owner(&path) {
                    Some(owner) if is_process_alive(owner.pid) => {
                        debug!(owner_pid = owner.pid, "lock held by live process");
                        return Ok(LockOutcome {
                            acquired: false,
                            owner: Some(owner),
                        });
                    }
                    Some(owner) => {
                        warn!(
                            owner_pid = owner.pid,
                            attempt, "reclaiming stale lock from dead process"
                        );
                        remove_if_exists(&path)?;
                    }
                    None => {
                        // A live daemon always writes a well-formed record;
                        // garbage cannot belong to one.
                        warn!(attempt, path = %path.display(), "reclaiming unparseable lock file");
                        remove_if_exists(&path)?;
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(JellyError::Fatal(format!(
        "could not acquire lock after {LOCK_RETRY_LIMIT} attempts"
    )))
}

/// Remove the lock file if this process still owns it. Best-effort; never
/// surfaces an error to the caller.
pub fn release_lock(state_dir: &Path) {
    let path = paths::lock_path(state_dir);
    match read_owner(&path) {
        Some(owner) if owner.pid == std::process::id() => {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(error = %e, "failed to remove lock file");
            } else {
                info!("lock released");
            }
        }
        Some(owner) => {
            debug!(
                owner_pid = owner.pid,
                "not releasing lock owned by another process"
            );
        }
        None => {}
    }
}

/// Read the current lock owner, if the file exists and parses.
pub fn read_owner(path: &Path) -> Option<LockRecord> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Whether a process with the given pid is alive.
///
/// `kill(pid, 0)` probes existence without signaling. EPERM means the
/// process exists but is not ours: alive. Safety over liveness.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw_pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn remove_if_exists(path: &Path) -> Result<(), JellyError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
