//! jelly-j daemon: the single long-lived backend behind every pane.
//!
//! The daemon owns one conversation, serializes model turns across all
//! connected clients, streams turn events back to the requesting client,
//! replays persisted history on registration, and periodically probes
//! workspace state for background suggestions.
//!
//! # Architecture
//!
//! - [`server::DaemonRuntime`]: lock, socket, and the core task that owns
//!   all mutable state
//! - [`lockfile`]: singleton lock with stale-owner reclaim
//! - [`history`]: append-only journal with bounded snapshot reads
//! - [`registry`]: client registry and per-request event routing
//! - [`queue`] + [`executor`]: global FIFO of turns, one in flight, with
//!   stale-resume recovery
//! - [`runtime`]: the model runtime adapter seam
//! - [`butler`] + [`heartbeat`]: pipe RPC to the in-multiplexer plugin and
//!   the background tidy probe

pub mod butler;
pub mod executor;
pub mod heartbeat;
pub mod history;
pub mod lockfile;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod server;

pub use runtime::{ChatEvent, ChatOutcome, ChatTurn, ClaudeRuntime, ModelRuntime};
pub use server::{DaemonConfig, DaemonRuntime, RunExit};
