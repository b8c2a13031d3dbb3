//! Wire protocol for the jelly-j daemon control plane.
//!
//! The transport is newline-delimited JSON over the daemon's Unix socket:
//! one JSON object per line, no bare newlines inside a frame. This crate
//! owns the closed set of frame shapes in both directions, the history
//! entry record they carry, and a small blocking client used by the
//! startup supervisor's health probe.

pub mod client;
pub mod frames;
pub mod history;

pub use client::ProbeClient;
pub use frames::{encode_frame, ClientFrame, DaemonFrame, MAX_FRAME_BYTES};
pub use history::{HistoryEntry, Role};
