//! Frame shapes for both directions of the control plane.
//!
//! Frames are internally tagged on `type` with snake_case discriminants and
//! camelCase field names. Every stream event carries the requestId of the
//! turn it belongs to; events without one are connection-scoped.

use serde::{Deserialize, Serialize};

use jelly_types::{JellyError, ModelAlias, ZellijEnv};

use crate::history::HistoryEntry;

/// Maximum accepted frame length. Oversized lines are answered with an
/// `error` frame and the connection is dropped.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Frames a client sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame after connect; everything else is rejected until the
    /// transport has registered.
    #[serde(rename_all = "camelCase")]
    RegisterClient {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zellij_session: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zellij_env: Option<ZellijEnv>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// Submit a user turn.
    #[serde(rename_all = "camelCase")]
    ChatRequest {
        request_id: String,
        client_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zellij_session: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zellij_env: Option<ZellijEnv>,
    },
    /// Change the conversation model (global effect, broadcast on success).
    #[serde(rename_all = "camelCase")]
    SetModel {
        request_id: String,
        client_id: String,
        alias: ModelAlias,
    },
    /// Clear the resume token; future turns start a fresh conversation.
    #[serde(rename_all = "camelCase")]
    NewSession {
        request_id: String,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zellij_session: Option<String>,
    },
    /// Liveness probe.
    #[serde(rename_all = "camelCase")]
    Ping { request_id: String, client_id: String },
}

impl ClientFrame {
    /// The client identifier the frame claims to come from.
    pub fn client_id(&self) -> &str {
        match self {
            Self::RegisterClient { client_id, .. }
            | Self::ChatRequest { client_id, .. }
            | Self::SetModel { client_id, .. }
            | Self::NewSession { client_id, .. }
            | Self::Ping { client_id, .. } => client_id,
        }
    }
}

/// Frames the daemon sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonFrame {
    /// Acknowledges registration; always followed by one `history_snapshot`.
    #[serde(rename_all = "camelCase")]
    Registered {
        client_id: String,
        daemon_pid: u32,
        model: ModelAlias,
        busy: bool,
    },
    /// Bounded replay of the history journal, sent once after `registered`.
    #[serde(rename_all = "camelCase")]
    HistorySnapshot { entries: Vec<HistoryEntry> },
    /// Informational line untied to a request.
    #[serde(rename_all = "camelCase")]
    StatusNote { message: String },
    /// A turn reached the head of the queue.
    #[serde(rename_all = "camelCase")]
    ChatStart {
        request_id: String,
        model: ModelAlias,
        queued_ahead: usize,
    },
    /// A fragment of assistant text; concatenation over the request yields
    /// the full turn.
    #[serde(rename_all = "camelCase")]
    ChatDelta { request_id: String, text: String },
    /// The model invoked a named tool.
    #[serde(rename_all = "camelCase")]
    ToolUse { request_id: String, name: String },
    /// Structured error from the model runtime for this turn.
    #[serde(rename_all = "camelCase")]
    ResultError {
        request_id: String,
        subtype: String,
        errors: Vec<String>,
    },
    /// Terminal frame for a request; exactly one per started request.
    #[serde(rename_all = "camelCase")]
    ChatEnd {
        request_id: String,
        ok: bool,
        model: ModelAlias,
    },
    /// Broadcast after a successful model change.
    #[serde(rename_all = "camelCase")]
    ModelUpdated {
        request_id: String,
        alias: ModelAlias,
    },
    #[serde(rename_all = "camelCase")]
    Pong { request_id: String, daemon_pid: u32 },
    /// Protocol-level or unexpected error.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
}

impl DaemonFrame {
    /// The requestId this event is tied to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::ChatStart { request_id, .. }
            | Self::ChatDelta { request_id, .. }
            | Self::ToolUse { request_id, .. }
            | Self::ResultError { request_id, .. }
            | Self::ChatEnd { request_id, .. }
            | Self::ModelUpdated { request_id, .. }
            | Self::Pong { request_id, .. } => Some(request_id),
            Self::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// Shorthand for a connection-scoped error frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            request_id: None,
            message: message.into(),
        }
    }

    /// Shorthand for a request-scoped error frame.
    pub fn request_error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            request_id: Some(request_id.into()),
            message: message.into(),
        }
    }
}

/// Serialize a frame to one wire line, newline included.
///
/// serde_json escapes newlines inside strings, so the only `\n` in the
/// output is the terminator.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, JellyError> {
    let mut json = serde_json::to_string(frame)
        .map_err(|e| JellyError::Protocol(format!("failed to encode frame: {e}")))?;
    json.push('\n');
    Ok(json)
}
