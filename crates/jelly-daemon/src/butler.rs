//! Pipe RPC client for the in-multiplexer butler plugin.
//!
//! The butler caches workspace state inside zellij and answers JSON
//! requests piped through the zellij CLI. The daemon only ever talks to it
//! through this client, always with the requesting session's environment
//! triple applied, never its own inherited one.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use jelly_types::ZellijEnv;

/// Deadline for ordinary pipe operations.
pub const PIPE_OP_TIMEOUT: Duration = Duration::from_secs(8);

/// Deadline for toggle-style pipe messages.
pub const PIPE_TOGGLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for plain zellij CLI invocations (overlay panes and the like).
pub const ZELLIJ_CLI_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a suggestion overlay stays on screen before closing itself.
const OVERLAY_SECONDS: u32 = 12;

/// Requests this client issues, tagged by `op`. The plugin also accepts
/// `hide_pane`/`show_pane`, but those belong to its own hotkey toggle
/// flow; the daemon never drives them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ButlerRequest {
    Ping,
    GetState,
    GetTrace {
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    ClearTrace,
    RenameTab {
        position: usize,
        name: String,
    },
    RenamePane {
        pane_id: u32,
        name: String,
    },
}

/// One tab in the cached workspace snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceTab {
    pub position: usize,
    pub name: String,
    pub active: bool,
    pub selectable_tiled_panes_count: usize,
    pub selectable_floating_panes_count: usize,
}

impl WorkspaceTab {
    /// Panes a user could land in, tiled or floating.
    pub fn selectable_panes(&self) -> usize {
        self.selectable_tiled_panes_count + self.selectable_floating_panes_count
    }
}

/// One pane in the cached workspace snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspacePane {
    pub id: u32,
    pub tab_index: usize,
    pub title: String,
    #[serde(default)]
    pub terminal_command: Option<String>,
    pub is_plugin: bool,
    pub is_focused: bool,
    pub is_floating: bool,
    pub is_suppressed: bool,
    pub exited: bool,
}

/// The butler's cached view of the workspace. Extra fields in the payload
/// (the butler's own runtime state) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceSnapshot {
    #[serde(default)]
    pub tabs: Vec<WorkspaceTab>,
    #[serde(default)]
    pub panes: Vec<WorkspacePane>,
}

/// Failures a pipe RPC can produce.
#[derive(Debug, thiserror::Error)]
pub enum ButlerError {
    /// Plugin loaded but caches not primed; retry or skip.
    #[error("butler not ready: {0}")]
    NotReady(String),
    /// The CLI call exceeded its deadline.
    #[error("butler pipe timed out")]
    Timeout,
    /// The targeted zellij session does not exist (anymore).
    #[error("no active zellij session")]
    NoSession,
    /// Anything else the plugin or CLI reported.
    #[error("butler call failed: {0}")]
    Failed(String),
}

/// Client for one session's butler, bound to that session's environment.
pub struct ButlerClient {
    env: ZellijEnv,
}

impl ButlerClient {
    pub fn new(env: ZellijEnv) -> Self {
        Self { env }
    }

    /// Liveness probe against the plugin.
    pub async fn ping(&self) -> Result<(), ButlerError> {
        self.call(&ButlerRequest::Ping, PIPE_TOGGLE_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Fetch the cached workspace snapshot.
    pub async fn get_state(&self) -> Result<WorkspaceSnapshot, ButlerError> {
        let result = self.call(&ButlerRequest::GetState, PIPE_OP_TIMEOUT).await?;
        serde_json::from_value(result)
            .map_err(|e| ButlerError::Failed(format!("unparseable workspace snapshot: {e}")))
    }

    /// Fetch the plugin's bounded trace ring.
    pub async fn get_trace(&self, limit: Option<usize>) -> Result<Vec<String>, ButlerError> {
        let result = self
            .call(&ButlerRequest::GetTrace { limit }, PIPE_OP_TIMEOUT)
            .await?;
        let entries = result
            .get("entries")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    /// Clear the plugin's trace ring.
    pub async fn clear_trace(&self) -> Result<(), ButlerError> {
        self.call(&ButlerRequest::ClearTrace, PIPE_OP_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Rename a tab in place; never moves user focus.
    pub async fn rename_tab(&self, position: usize, name: &str) -> Result<(), ButlerError> {
        self.call(
            &ButlerRequest::RenameTab {
                position,
                name: name.into(),
            },
            PIPE_OP_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    /// Rename a pane in place; never moves user focus.
    pub async fn rename_pane(&self, pane_id: u32, name: &str) -> Result<(), ButlerError> {
        self.call(
            &ButlerRequest::RenamePane {
                pane_id,
                name: name.into(),
            },
            PIPE_OP_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    /// Send one request through `zellij pipe` and decode the response
    /// envelope.
    async fn call(
        &self,
        request: &ButlerRequest,
        timeout: Duration,
    ) -> Result<serde_json::Value, ButlerError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| ButlerError::Failed(format!("failed to encode request: {e}")))?;

        let mut command = tokio::process::Command::new(self.env.binary());
        if let Some(ref session) = self.env.session_name {
            command.arg("--session").arg(session);
        }
        command
            .args(["pipe", "--name", "request", "--"])
            .arg(&payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in self.env.vars() {
            command.env(key, value);
        }

        let output = tokio::time::timeout(timeout, async {
            command
                .spawn()
                .map_err(|e| ButlerError::Failed(format!("could not run zellij: {e}")))?
                .wait_with_output()
                .await
                .map_err(|e| ButlerError::Failed(format!("zellij pipe failed: {e}")))
        })
        .await
        .map_err(|_| ButlerError::Timeout)??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("session") && stderr.to_lowercase().contains("not found")
            {
                return Err(ButlerError::NoSession);
            }
            return Err(ButlerError::Failed(format!(
                "zellij pipe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_response(&stdout)
    }
}

/// Decode the `{ok:true,result}` / `{ok:false,code,error}` envelope from
/// the pipe output. The CLI may echo other lines around it; the last
/// parseable envelope wins.
pub fn parse_response(output: &str) -> Result<serde_json::Value, ButlerError> {
    let envelope = output
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
        .find(|v| v.get("ok").is_some())
        .ok_or_else(|| ButlerError::Failed("no response envelope in pipe output".into()))?;

    if envelope.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
        Ok(envelope.get("result").cloned().unwrap_or(serde_json::Value::Null))
    } else {
        let code = envelope.get("code").and_then(|v| v.as_str()).unwrap_or("");
        let message = envelope
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown butler error")
            .to_string();
        if code == "not_ready" {
            Err(ButlerError::NotReady(message))
        } else {
            Err(ButlerError::Failed(message))
        }
    }
}

/// Open a small floating pane showing `text`, closing itself after a few
/// seconds. The text travels through an environment variable so no shell
/// quoting of model output is ever needed.
pub async fn open_overlay(env: &ZellijEnv, text: &str) -> Result<(), ButlerError> {
    let mut command = tokio::process::Command::new(env.binary());
    if let Some(ref session) = env.session_name {
        command.arg("--session").arg(session);
    }
    command
        .args([
            "run",
            "--floating",
            "--close-on-exit",
            "--name",
            "Jelly J",
            "--",
            "sh",
            "-c",
        ])
        .arg(format!(
            "printf '%s\\n' \"$JELLY_J_SUGGESTION\"; sleep {OVERLAY_SECONDS}"
        ))
        .env("JELLY_J_SUGGESTION", text)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    for (key, value) in env.vars() {
        command.env(key, value);
    }

    let status = tokio::time::timeout(ZELLIJ_CLI_TIMEOUT, async {
        command
            .spawn()
            .map_err(|e| ButlerError::Failed(format!("could not run zellij: {e}")))?
            .wait()
            .await
            .map_err(|e| ButlerError::Failed(format!("zellij run failed: {e}")))
    })
    .await
    .map_err(|_| ButlerError::Timeout)??;

    if !status.success() {
        debug!(%status, "overlay pane launch failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_serialize_with_op_tags() {
        let json = serde_json::to_value(ButlerRequest::GetState).unwrap();
        assert_eq!(json["op"], "get_state");

        let json = serde_json::to_value(ButlerRequest::RenameTab {
            position: 2,
            name: "builds".into(),
        })
        .unwrap();
        assert_eq!(json["op"], "rename_tab");
        assert_eq!(json["position"], 2);
        assert_eq!(json["name"], "builds");

        let json = serde_json::to_value(ButlerRequest::RenamePane {
            pane_id: 7,
            name: "logs".into(),
        })
        .unwrap();
        assert_eq!(json["op"], "rename_pane");
        assert_eq!(json["pane_id"], 7);
        assert_eq!(json["name"], "logs");

        let json = serde_json::to_value(ButlerRequest::GetTrace { limit: Some(50) }).unwrap();
        assert_eq!(json["op"], "get_trace");
        assert_eq!(json["limit"], 50);
    }

    #[test]
    fn ok_envelope_yields_result() {
        let result = parse_response(r#"{"ok":true,"result":{"tabs":[],"panes":[]}}"#).unwrap();
        assert!(result.get("tabs").is_some());
    }

    #[test]
    fn envelope_may_follow_cli_noise() {
        let output = "some zellij banner\n{\"ok\":true,\"result\":{\"x\":1}}\n";
        let result = parse_response(output).unwrap();
        assert_eq!(result["x"], 1);
    }

    #[test]
    fn not_ready_is_distinguished() {
        let err = parse_response(r#"{"ok":false,"code":"not_ready","error":"caches cold"}"#)
            .unwrap_err();
        assert!(matches!(err, ButlerError::NotReady(_)));

        let err = parse_response(r#"{"ok":false,"code":"invalid_request","error":"bad"}"#)
            .unwrap_err();
        assert!(matches!(err, ButlerError::Failed(_)));
    }

    #[test]
    fn missing_envelope_is_an_error() {
        assert!(matches!(
            parse_response("no json at all"),
            Err(ButlerError::Failed(_))
        ));
    }

    #[test]
    fn snapshot_parses_plugin_shape() {
        // Shape as the plugin emits it, including the runtime-state field
        // this client does not model.
        let payload = serde_json::json!({
            "tabs": [
                {"position": 0, "name": "Tab #1", "active": true,
                 "selectable_tiled_panes_count": 3, "selectable_floating_panes_count": 2}
            ],
            "panes": [
                {"id": 4, "tab_index": 0, "title": "vim", "terminal_command": "vim src/main.rs",
                 "is_plugin": false, "is_focused": true, "is_floating": false,
                 "is_suppressed": false, "exited": false}
            ],
            "butler": {"ready": true, "trace_len": 12}
        });
        let snapshot: WorkspaceSnapshot = serde_json::from_value(payload).unwrap();
        assert_eq!(snapshot.tabs.len(), 1);
        assert_eq!(snapshot.tabs[0].selectable_panes(), 5);
        assert_eq!(snapshot.panes[0].terminal_command.as_deref(), Some("vim src/main.rs"));
    }
}
