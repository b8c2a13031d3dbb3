//! Error kinds shared across the jelly-j crates.

/// Errors that can occur across the jelly-j runtime.
///
/// Every fallible operation returns one of these kinds internally; only
/// [`JellyError::Fatal`] propagates to scheduler exit. Everything else is
/// surfaced on the owning request stream or logged and swallowed.
#[derive(Debug, thiserror::Error)]
pub enum JellyError {
    /// Malformed frame, unknown message type, or frame from an
    /// unregistered transport.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A tool invocation was denied by the permission policy.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The model runtime no longer knows the held resume token.
    #[error("stale conversation: {0}")]
    StaleResume(String),

    /// A subprocess or pipe RPC exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Filesystem or socket I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant-threatening failure; the daemon shuts down on these.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JellyError {
    /// Whether this error should tear the daemon down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Substrings the model runtime emits when a resume token has gone stale.
const STALE_RESUME_PATTERNS: &[&str] = &[
    "no conversation found with session id",
    "no conversation found with session",
    "session not found",
];

/// Match the runtime's stale-conversation error text structurally.
///
/// Matching is the precondition for the executor's single fresh-session
/// retry; unmatched failures are never retried.
pub fn matches_stale_resume(text: &str) -> bool {
    let lowered = text.to_lowercase();
    STALE_RESUME_PATTERNS.iter().any(|p| lowered.contains(p))
}
