//! Model Runtime adapter.
//!
//! Presents the external model runtime behind a narrow trait: one user
//! turn in, a stream of tagged events out, a resume token back. The
//! production implementation spawns the `claude` CLI with
//! `--output-format stream-json` and reshapes its NDJSON lines into
//! [`ChatEvent`]s. Retry policy does not live here; the executor owns the
//! stale-resume retry.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use jelly_types::{matches_stale_resume, JellyError, ModelAlias, ZellijEnv};

/// How long the cheap-model one-shot path may take end to end.
const COMPLETE_JSON_TIMEOUT: Duration = Duration::from_secs(60);

/// Name of the runtime binary.
const RUNTIME_BINARY: &str = "claude";

/// Workspace-control capability set mounted for user turns.
const WORKSPACE_TOOLS: &str = "mcp__workspace__*";

/// Tool capabilities that run without prompting. Shell execution is absent
/// on purpose: arbitrary commands always prompt.
const UNPROMPTED_TOOLS: &[&str] = &["Read", "Grep", "Glob", "WebSearch", "TodoWrite"];

/// One tagged event from the model runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A fragment of assistant text, in emission order.
    Text(String),
    /// The model invoked a named tool.
    ToolUse { name: String },
    /// Structured non-success result for the turn.
    ResultError { subtype: String, errors: Vec<String> },
    /// The permission policy wants a human decision.
    PermissionRequest { tool: String, reason: String },
}

/// Everything one turn needs from the caller.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub text: String,
    /// Resume token from the previous turn, absent for a fresh conversation.
    pub resume: Option<String>,
    pub model: ModelAlias,
    /// One-turn context prefix (wall clock, session-switch statement).
    pub context_prefix: Option<String>,
    /// Multiplexer identity for any tool subprocess the runtime spawns.
    pub env: ZellijEnv,
}

/// What a completed turn hands back.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Token for continuing the conversation; the input token if the
    /// runtime never announced a new one.
    pub resume: Option<String>,
}

/// The seam between the daemon and the external model runtime.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Run one turn, streaming events as they arrive.
    ///
    /// Errors are reserved for genuinely fatal conditions (the subprocess
    /// could not be started, its output was unreadable); soft failures go
    /// through [`ChatEvent::ResultError`].
    async fn chat(
        &self,
        turn: ChatTurn,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<ChatOutcome, JellyError>;

    /// Cheap one-shot completion returning parsed JSON; used by the
    /// heartbeat. No tools, no conversation state.
    async fn complete_json(&self, prompt: &str, env: &ZellijEnv) -> Result<Value, JellyError>;
}

/// Production runtime driving the `claude` CLI.
pub struct ClaudeRuntime {
    binary: String,
    config_roots: Vec<PathBuf>,
}

impl ClaudeRuntime {
    pub fn new() -> Self {
        Self {
            binary: RUNTIME_BINARY.into(),
            config_roots: detected_config_roots(),
        }
    }

    /// CLI arguments for one streaming turn.
    fn chat_args(&self, turn: &ChatTurn) -> Vec<String> {
        let mut args = vec![
            "-p".into(),
            turn.text.clone(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--model".into(),
            turn.model.runtime_id().into(),
        ];
        if let Some(ref token) = turn.resume {
            args.push("--resume".into());
            args.push(token.clone());
        }
        if let Some(ref prefix) = turn.context_prefix {
            args.push("--append-system-prompt".into());
            args.push(prefix.clone());
        }
        args.push("--allowedTools".into());
        args.push(self.allowed_tools().join(","));
        args
    }

    /// The permission policy, expressed as the runtime's allowed-tool list:
    /// workspace control and read-side capabilities run unprompted, file
    /// edits only inside detected configuration roots, and everything else
    /// (shell above all) falls through to a prompt.
    fn allowed_tools(&self) -> Vec<String> {
        let mut allowed: Vec<String> = UNPROMPTED_TOOLS.iter().map(|s| s.to_string()).collect();
        allowed.push(WORKSPACE_TOOLS.into());
        for root in &self.config_roots {
            let root = root.display();
            allowed.push(format!("Edit({root}/**)"));
            allowed.push(format!("Write({root}/**)"));
        }
        allowed
    }
}

impl Default for ClaudeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration roots the agent may edit without prompting: the zellij
/// config directory and our own state directory.
fn detected_config_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        });
    if let Some(config_home) = config_home {
        roots.push(config_home.join("zellij"));
    }
    roots.push(jelly_types::paths::state_dir());
    roots
}

#[async_trait]
impl ModelRuntime for ClaudeRuntime {
    async fn chat(
        &self,
        turn: ChatTurn,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<ChatOutcome, JellyError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(self.chat_args(&turn))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in turn.env.vars() {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| JellyError::Fatal(format!("could not start model runtime: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JellyError::Fatal("model runtime stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| JellyError::Fatal("model runtime stderr unavailable".into()))?;

        // Drain stderr concurrently so the child never blocks on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut resume = turn.resume.clone();
        let mut saw_result = false;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| JellyError::Fatal(format!("unreadable model runtime output: {e}")))?
        {
            let parsed = parse_stream_line(&line);
            if let Some(session_id) = parsed.session_id {
                resume = Some(session_id);
            }
            saw_result |= parsed.saw_result;
            for event in parsed.events {
                // A departed consumer is not our problem; keep draining so
                // the resume token still comes back.
                let _ = events.send(event).await;
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| JellyError::Fatal(format!("model runtime wait failed: {e}")))?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() && !saw_result {
            // Nothing structured was surfaced; the failure is only visible
            // here. Stale-resume complaints can arrive this way.
            let tail: String = stderr_text.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            if matches_stale_resume(&tail) {
                return Err(JellyError::StaleResume(tail));
            }
            return Err(JellyError::Protocol(format!(
                "model runtime exited with {status}: {tail}"
            )));
        }
        if !stderr_text.trim().is_empty() {
            debug!(stderr = %stderr_text.trim(), "model runtime stderr");
        }

        Ok(ChatOutcome { resume })
    }

    async fn complete_json(&self, prompt: &str, env: &ZellijEnv) -> Result<Value, JellyError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args([
                "-p",
                prompt,
                "--output-format",
                "json",
                "--model",
                ModelAlias::Haiku.runtime_id(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env.vars() {
            command.env(key, value);
        }

        let output = tokio::time::timeout(COMPLETE_JSON_TIMEOUT, async {
            let child = command
                .spawn()
                .map_err(|e| JellyError::Fatal(format!("could not start model runtime: {e}")))?;
            child
                .wait_with_output()
                .await
                .map_err(|e| JellyError::Fatal(format!("model runtime wait failed: {e}")))
        })
        .await
        .map_err(|_| JellyError::Timeout("cheap-model completion".into()))??;

        if !output.status.success() {
            return Err(JellyError::Protocol(format!(
                "cheap-model completion exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| JellyError::Protocol(format!("unparseable completion envelope: {e}")))?;
        let result_text = envelope
            .get("result")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JellyError::Protocol("completion envelope missing result".into()))?;
        extract_json(result_text)
    }
}

/// What one stream-json line contributed.
#[derive(Debug, Default)]
pub struct ParsedLine {
    pub events: Vec<ChatEvent>,
    pub session_id: Option<String>,
    pub saw_result: bool,
}

/// Reshape one NDJSON line from the runtime into events.
///
/// Unknown event types are skipped; unparseable lines are logged and
/// skipped rather than aborting the turn.
pub fn parse_stream_line(raw: &str) -> ParsedLine {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ParsedLine::default();
    }
    let obj: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "skipping unparseable runtime line");
            return ParsedLine::default();
        }
    };

    let mut parsed = ParsedLine {
        session_id: obj
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        ..Default::default()
    };

    match obj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "assistant" => {
            let blocks = obj
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for block in blocks {
                match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                parsed.events.push(ChatEvent::Text(text.to_string()));
                            }
                        }
                    }
                    "tool_use" => {
                        let name = block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        parsed.events.push(ChatEvent::ToolUse { name });
                    }
                    // Thinking blocks and tool results stay internal.
                    _ => {}
                }
            }
        }
        "result" => {
            parsed.saw_result = true;
            let subtype = obj
                .get("subtype")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let is_error = obj.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
            if is_error || subtype != "success" {
                parsed.events.push(ChatEvent::ResultError {
                    subtype: subtype.to_string(),
                    errors: result_errors(&obj),
                });
            }
        }
        "control_request" => {
            if let Some(request) = obj.get("request") {
                if request.get("subtype").and_then(|v| v.as_str()) == Some("can_use_tool") {
                    let tool = request
                        .get("tool_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let reason = request
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("permission required")
                        .to_string();
                    parsed
                        .events
                        .push(ChatEvent::PermissionRequest { tool, reason });
                }
            }
        }
        // "system" carries the init session_id already captured above.
        _ => {}
    }

    parsed
}

/// Pull the error strings out of a non-success result.
fn result_errors(obj: &Value) -> Vec<String> {
    if let Some(list) = obj.get("errors").and_then(|v| v.as_array()) {
        let errors: Vec<String> = list
            .iter()
            .filter_map(|e| {
                e.as_str()
                    .map(str::to_string)
                    .or_else(|| e.get("message").and_then(|m| m.as_str()).map(str::to_string))
            })
            .collect();
        if !errors.is_empty() {
            return errors;
        }
    }
    for key in ["result", "error", "message"] {
        if let Some(text) = obj.get(key).and_then(|v| v.as_str()) {
            if !text.is_empty() {
                return vec![text.to_string()];
            }
        }
    }
    vec!["unknown runtime error".into()]
}

/// Parse a JSON value out of model text, tolerating markdown fences.
pub fn extract_json(text: &str) -> Result<Value, JellyError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body)
        .map_err(|e| JellyError::Protocol(format!("model did not return valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_args_include_resume_only_when_held() {
        let runtime = ClaudeRuntime::new();
        let fresh = ChatTurn {
            text: "hi".into(),
            resume: None,
            model: ModelAlias::Opus,
            context_prefix: None,
            env: ZellijEnv::default(),
        };
        let args = runtime.chat_args(&fresh);
        assert!(!args.iter().any(|a| a == "--resume"));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&ModelAlias::Opus.runtime_id().to_string()));

        let resumed = ChatTurn {
            resume: Some("tok-1".into()),
            context_prefix: Some("Current time: now".into()),
            ..fresh
        };
        let args = runtime.chat_args(&resumed);
        let at = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[at + 1], "tok-1");
        assert!(args.iter().any(|a| a == "--append-system-prompt"));
    }

    #[test]
    fn shell_is_never_in_the_allowed_set() {
        let runtime = ClaudeRuntime::new();
        let allowed = runtime.allowed_tools();
        assert!(!allowed.iter().any(|t| t.starts_with("Bash")));
        assert!(allowed.contains(&WORKSPACE_TOOLS.to_string()));
        // Edits are scoped to config roots, never bare.
        assert!(!allowed.iter().any(|t| t == "Edit" || t == "Write"));
        assert!(allowed.iter().any(|t| t.starts_with("Edit(")));
    }

    #[test]
    fn init_line_yields_session_id() {
        let parsed = parse_stream_line(
            r#"{"type":"system","subtype":"init","session_id":"abc-123","model":"claude-opus-4-20250514"}"#,
        );
        assert_eq!(parsed.session_id.as_deref(), Some("abc-123"));
        assert!(parsed.events.is_empty());
    }

    #[test]
    fn assistant_line_yields_text_and_tool_use() {
        let parsed = parse_stream_line(
            r#"{"type":"assistant","session_id":"abc","message":{"content":[
                {"type":"text","text":"Let me rename that tab."},
                {"type":"tool_use","name":"mcp__workspace__rename_tab","input":{"position":1}},
                {"type":"thinking","thinking":"hidden"}
            ]}}"#,
        );
        assert_eq!(
            parsed.events,
            vec![
                ChatEvent::Text("Let me rename that tab.".into()),
                ChatEvent::ToolUse {
                    name: "mcp__workspace__rename_tab".into()
                },
            ]
        );
    }

    #[test]
    fn success_result_yields_no_error() {
        let parsed = parse_stream_line(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"abc"}"#,
        );
        assert!(parsed.saw_result);
        assert!(parsed.events.is_empty());
    }

    #[test]
    fn error_result_yields_result_error() {
        let parsed = parse_stream_line(
            r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"No conversation found with session ID 0000"}"#,
        );
        assert_eq!(
            parsed.events,
            vec![ChatEvent::ResultError {
                subtype: "error_during_execution".into(),
                errors: vec!["No conversation found with session ID 0000".into()],
            }]
        );
    }

    #[test]
    fn errors_array_is_preferred_when_present() {
        let parsed = parse_stream_line(
            r#"{"type":"result","subtype":"error_max_turns","is_error":true,"errors":["too many turns",{"message":"budget"}]}"#,
        );
        match &parsed.events[0] {
            ChatEvent::ResultError { errors, .. } => {
                assert_eq!(errors, &vec!["too many turns".to_string(), "budget".into()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn permission_request_line_is_surfaced() {
        let parsed = parse_stream_line(
            r#"{"type":"control_request","request":{"subtype":"can_use_tool","tool_name":"Bash","reason":"shell execution"}}"#,
        );
        assert_eq!(
            parsed.events,
            vec![ChatEvent::PermissionRequest {
                tool: "Bash".into(),
                reason: "shell execution".into()
            }]
        );
    }

    #[test]
    fn garbage_lines_are_skipped() {
        assert!(parse_stream_line("").events.is_empty());
        assert!(parse_stream_line("not json").events.is_empty());
        assert!(parse_stream_line(r#"{"type":"unknown_kind"}"#).events.is_empty());
    }

    #[test]
    fn extract_json_handles_fences() {
        let plain = extract_json(r#"{"renames":[]}"#).unwrap();
        assert!(plain["renames"].as_array().unwrap().is_empty());

        let fenced = extract_json("```json\n{\"suggestion\":\"split that tab\"}\n```").unwrap();
        assert_eq!(fenced["suggestion"], "split that tab");

        assert!(extract_json("no json here").is_err());
    }
}
