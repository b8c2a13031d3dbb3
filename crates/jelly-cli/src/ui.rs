//! UI client session: one per pane, short-lived, dumb on purpose.
//!
//! Connects, registers, replays the history snapshot, then alternates
//! between a single-line editor and streamed daemon events. All state that
//! matters lives in the daemon; the client only tracks the one request it
//! may have in flight.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use jelly_proto::{encode_frame, ClientFrame, DaemonFrame, HistoryEntry, Role};
use jelly_types::{paths, ModelAlias, ZellijEnv};

/// Client-side deadline for `registered` + `history_snapshot`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Words intercepted instead of terminating the client.
const EXIT_WORDS: &[&str] = &["exit", "quit", "bye", "q"];

/// What the user typed, classified.
#[derive(Debug, PartialEq, Eq)]
enum UiCommand {
    Empty,
    /// `/model` with no argument.
    ShowModel,
    SetModel(ModelAlias),
    NewSession,
    /// Unknown alias or unknown slash command.
    UsageError(String),
    ExitIntercepted,
    Chat(String),
}

/// Classify one input line. Slash commands are parsed locally; everything
/// else is a chat message.
fn parse_input(line: &str) -> UiCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return UiCommand::Empty;
    }
    if EXIT_WORDS.contains(&trimmed.to_lowercase().as_str()) {
        return UiCommand::ExitIntercepted;
    }
    if let Some(rest) = trimmed.strip_prefix('/') {
        let mut parts = rest.split_whitespace();
        return match (parts.next(), parts.next(), parts.next()) {
            (Some("model"), None, None) => UiCommand::ShowModel,
            (Some("model"), Some(alias), None) => match alias.parse::<ModelAlias>() {
                Ok(alias) => UiCommand::SetModel(alias),
                Err(e) => UiCommand::UsageError(e),
            },
            (Some("new"), None, None) => UiCommand::NewSession,
            _ => UiCommand::UsageError(format!(
                "unknown command '/{rest}' (available: /model [alias], /new)"
            )),
        };
    }
    UiCommand::Chat(trimmed.to_string())
}

enum InputEvent {
    Line(String),
    Eof,
}

/// Run the UI client against an existing daemon.
pub async fn run() -> anyhow::Result<()> {
    let state_dir = paths::state_dir();
    let socket = paths::socket_path(&state_dir);

    let stream = UnixStream::connect(&socket).await.with_context(|| {
        format!(
            "cannot reach the jelly-j daemon at {}; run `jelly-j` (no subcommand) to start one",
            socket.display()
        )
    })?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let client_id = format!("ui-{}", Uuid::new_v4());
    let env = ZellijEnv::capture();
    let session = env.session_name.clone();

    send_frame(
        &mut writer,
        &ClientFrame::RegisterClient {
            client_id: client_id.clone(),
            zellij_session: session.clone(),
            zellij_env: (!env.is_empty()).then(|| env.clone()),
            cwd: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
            hostname: None,
            pid: Some(std::process::id()),
        },
    )
    .await?;

    let (model, busy, entries) =
        tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut lines, &client_id))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "daemon did not answer within {:.1}s; it may still be starting -- \
                     run `jelly-j` to restart it if this persists",
                    HANDSHAKE_TIMEOUT.as_secs_f32()
                )
            })??;

    render_history(&entries);
    muted(&format!(
        "connected (model {model}{})",
        if busy { ", a turn is in flight" } else { "" }
    ));

    // The editor lives on its own thread; it reads exactly one line per
    // resume token so the prompt never fights with streamed output.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<InputEvent>();
    let (resume_tx, resume_rx) = std::sync::mpsc::channel::<()>();
    let history_path = paths::ui_history_path(&state_dir);
    std::thread::spawn(move || input_loop(line_tx, resume_rx, history_path));

    let mut ui = UiState {
        client_id,
        session,
        env,
        model,
        in_flight: None,
        awaiting_ack: false,
    };
    resume_tx.send(()).ok();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let frame: DaemonFrame = match serde_json::from_str(&line) {
                        Ok(frame) => frame,
                        Err(e) => {
                            muted(&format!("(unreadable frame from daemon: {e})"));
                            continue;
                        }
                    };
                    if ui.handle_frame(frame) {
                        resume_tx.send(()).ok();
                    }
                }
                None => {
                    muted("daemon closed the connection");
                    break;
                }
            },
            event = line_rx.recv() => match event {
                Some(InputEvent::Line(text)) => {
                    if ui.handle_input(&text, &mut writer).await? {
                        resume_tx.send(()).ok();
                    }
                }
                Some(InputEvent::Eof) | None => break,
            },
        }
    }

    Ok(())
}

struct UiState {
    client_id: String,
    session: Option<String>,
    env: ZellijEnv,
    model: ModelAlias,
    /// The one request this client may have outstanding.
    in_flight: Option<String>,
    /// A `/model` or `/new` waiting for its acknowledgement frame.
    awaiting_ack: bool,
}

impl UiState {
    /// Render one daemon frame. Returns whether the prompt should come
    /// back.
    fn handle_frame(&mut self, frame: DaemonFrame) -> bool {
        match frame {
            DaemonFrame::StatusNote { message } => {
                muted(&message);
                std::mem::take(&mut self.awaiting_ack)
            }
            DaemonFrame::ChatStart { queued_ahead, .. } => {
                if queued_ahead > 0 {
                    muted(&format!("({queued_ahead} turn(s) ahead in the queue)"));
                }
                false
            }
            DaemonFrame::ChatDelta { request_id, text } => {
                if self.in_flight.as_deref() == Some(request_id.as_str()) {
                    print_flush(&text);
                }
                false
            }
            DaemonFrame::ToolUse { name, .. } => {
                println!();
                muted(&format!("[tool] {name}"));
                false
            }
            DaemonFrame::ResultError {
                subtype, errors, ..
            } => {
                println!();
                eprintln!("[{subtype}] {}", errors.join("; "));
                false
            }
            DaemonFrame::ChatEnd { ok, model, .. } => {
                println!();
                if !ok {
                    muted("(turn failed)");
                }
                self.model = model;
                self.in_flight = None;
                true
            }
            DaemonFrame::ModelUpdated { alias, .. } => {
                self.model = alias;
                muted(&format!("model set to {alias}"));
                std::mem::take(&mut self.awaiting_ack)
            }
            DaemonFrame::Error {
                request_id,
                message,
            } => {
                eprintln!("error: {message}");
                if self.awaiting_ack {
                    self.awaiting_ack = false;
                    return true;
                }
                // An error for our in-flight turn is followed by chat_end;
                // keep waiting for it. Anything else re-prompts.
                match (&self.in_flight, request_id) {
                    (Some(mine), Some(theirs)) if *mine == theirs => false,
                    _ => self.in_flight.is_none(),
                }
            }
            // Handshake frames after startup (e.g. another registration's
            // broadcast never happens, but be tolerant).
            DaemonFrame::Registered { .. }
            | DaemonFrame::HistorySnapshot { .. }
            | DaemonFrame::Pong { .. } => false,
        }
    }

    /// Act on one line of input. Returns whether the prompt should come
    /// back immediately.
    async fn handle_input(
        &mut self,
        line: &str,
        writer: &mut OwnedWriteHalf,
    ) -> anyhow::Result<bool> {
        match parse_input(line) {
            UiCommand::Empty => Ok(true),
            UiCommand::ShowModel => {
                println!(
                    "current model: {} (available: {})",
                    self.model,
                    ModelAlias::ALL
                        .iter()
                        .map(|a| a.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                Ok(true)
            }
            UiCommand::SetModel(alias) => {
                if alias == self.model {
                    muted(&format!("already using {alias}"));
                    return Ok(true);
                }
                send_frame(
                    writer,
                    &ClientFrame::SetModel {
                        request_id: Uuid::new_v4().to_string(),
                        client_id: self.client_id.clone(),
                        alias,
                    },
                )
                .await?;
                self.awaiting_ack = true;
                Ok(false)
            }
            UiCommand::NewSession => {
                if self.in_flight.is_some() {
                    muted("a turn is in flight; try /new once it finishes");
                    return Ok(true);
                }
                send_frame(
                    writer,
                    &ClientFrame::NewSession {
                        request_id: Uuid::new_v4().to_string(),
                        client_id: self.client_id.clone(),
                        zellij_session: self.session.clone(),
                    },
                )
                .await?;
                self.awaiting_ack = true;
                Ok(false)
            }
            UiCommand::UsageError(message) => {
                eprintln!("{message}");
                Ok(true)
            }
            UiCommand::ExitIntercepted => {
                muted("exit is disabled here; hide this pane with the jelly-j hotkey instead");
                Ok(true)
            }
            UiCommand::Chat(text) => {
                if self.in_flight.is_some() {
                    muted("one request at a time; wait for the current turn to finish");
                    return Ok(true);
                }
                let request_id = Uuid::new_v4().to_string();
                send_frame(
                    writer,
                    &ClientFrame::ChatRequest {
                        request_id: request_id.clone(),
                        client_id: self.client_id.clone(),
                        text,
                        zellij_session: self.session.clone(),
                        zellij_env: (!self.env.is_empty()).then(|| self.env.clone()),
                    },
                )
                .await?;
                self.in_flight = Some(request_id);
                Ok(false)
            }
        }
    }
}

/// Read `registered` then `history_snapshot`, in that order.
async fn handshake(
    lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
    client_id: &str,
) -> anyhow::Result<(ModelAlias, bool, Vec<HistoryEntry>)> {
    let (model, busy) = match read_frame(lines).await? {
        DaemonFrame::Registered {
            client_id: cid,
            model,
            busy,
            ..
        } if cid == client_id => (model, busy),
        other => anyhow::bail!("handshake expected registered, got {other:?}"),
    };
    let entries = match read_frame(lines).await? {
        DaemonFrame::HistorySnapshot { entries } => entries,
        other => anyhow::bail!("handshake expected history_snapshot, got {other:?}"),
    };
    Ok((model, busy, entries))
}

async fn read_frame(
    lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
) -> anyhow::Result<DaemonFrame> {
    loop {
        let line = lines
            .next_line()
            .await?
            .context("daemon closed the connection during the handshake")?;
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .with_context(|| format!("unparseable frame from daemon: {line}"));
    }
}

async fn send_frame(writer: &mut OwnedWriteHalf, frame: &ClientFrame) -> anyhow::Result<()> {
    let line = encode_frame(frame)?;
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Replay the history snapshot as a transcript.
fn render_history(entries: &[HistoryEntry]) {
    if entries.is_empty() {
        return;
    }
    muted("--- recent history ---");
    for entry in entries {
        let stamp = entry
            .timestamp
            .with_timezone(&chrono::Local)
            .format("%H:%M");
        match entry.role {
            Role::User => println!("\x1b[2m[{stamp}]\x1b[0m you> {}", entry.text),
            Role::Assistant => println!("\x1b[2m[{stamp}]\x1b[0m {}", entry.text),
            Role::Note => muted(&format!("[{stamp}] {}", entry.text)),
            Role::Error => println!("\x1b[2m[{stamp}]\x1b[0m [error] {}", entry.text),
        }
    }
    muted("----------------------");
}

/// The blocking editor loop: one line per resume token.
fn input_loop(
    tx: mpsc::UnboundedSender<InputEvent>,
    resume: std::sync::mpsc::Receiver<()>,
    history_path: PathBuf,
) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("cannot open line editor: {e}");
            let _ = tx.send(InputEvent::Eof);
            return;
        }
    };
    let _ = editor.load_history(&history_path);

    while resume.recv().is_ok() {
        loop {
            match editor.readline("jelly> ") {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        let _ = editor.add_history_entry(line.as_str());
                        let _ = editor.save_history(&history_path);
                    }
                    if tx.send(InputEvent::Line(line)).is_err() {
                        return;
                    }
                    break;
                }
                Err(ReadlineError::Interrupted) => {
                    // Ctrl-C never terminates the client; the pane is
                    // hidden and re-shown via the hotkey.
                    muted("(^C -- use the jelly-j hotkey to hide this pane)");
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    let _ = tx.send(InputEvent::Eof);
                    return;
                }
                Err(e) => {
                    eprintln!("input error: {e}");
                    let _ = tx.send(InputEvent::Eof);
                    return;
                }
            }
        }
    }
}

fn muted(text: &str) {
    println!("\x1b[2m{text}\x1b[0m");
}

fn print_flush(text: &str) {
    use std::io::Write;
    print!("{text}");
    let _ = std::io::stdout().flush();
}
