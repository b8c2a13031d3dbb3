//! Shared helpers for daemon integration tests.
//!
//! Each integration test file compiles common/ as its own module, so not
//! every helper is used in every file.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};

use jelly_daemon::heartbeat::HeartbeatConfig;
use jelly_daemon::{ChatEvent, ChatOutcome, ChatTurn, DaemonConfig, DaemonRuntime, ModelRuntime};
use jelly_proto::{encode_frame, ClientFrame, DaemonFrame, HistoryEntry};
use jelly_types::{JellyError, ModelAlias, ZellijEnv};

/// Per-frame read deadline in tests.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A model runtime that echoes the user text back in two fragments.
///
/// Resume tokens listed in `stale_tokens` produce the runtime's stale
/// conversation error instead, exactly once per call, the way the real
/// runtime reports a session it no longer knows.
pub struct FakeRuntime {
    delay: Duration,
    calls: Mutex<u32>,
    stale_tokens: Mutex<Vec<String>>,
    /// Every resume token the runtime was invoked with, in call order.
    pub seen_resumes: Mutex<Vec<Option<String>>>,
    /// Every context prefix the runtime was invoked with.
    pub seen_prefixes: Mutex<Vec<Option<String>>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(10))
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: Mutex::new(0),
            stale_tokens: Mutex::new(Vec::new()),
            seen_resumes: Mutex::new(Vec::new()),
            seen_prefixes: Mutex::new(Vec::new()),
        })
    }

    pub fn mark_stale(&self, token: &str) {
        self.stale_tokens.lock().unwrap().push(token.into());
    }
}

#[async_trait]
impl ModelRuntime for FakeRuntime {
    async fn chat(
        &self,
        turn: ChatTurn,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<ChatOutcome, JellyError> {
        self.seen_resumes.lock().unwrap().push(turn.resume.clone());
        self.seen_prefixes
            .lock()
            .unwrap()
            .push(turn.context_prefix.clone());

        if let Some(ref token) = turn.resume {
            if self.stale_tokens.lock().unwrap().contains(token) {
                let _ = events
                    .send(ChatEvent::ResultError {
                        subtype: "error_during_execution".into(),
                        errors: vec![format!("No conversation found with session ID {token}")],
                    })
                    .await;
                return Ok(ChatOutcome { resume: None });
            }
        }

        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };

        let _ = events.send(ChatEvent::Text("echo: ".into())).await;
        tokio::time::sleep(self.delay).await;
        let _ = events.send(ChatEvent::Text(turn.text.clone())).await;

        Ok(ChatOutcome {
            resume: Some(format!("sess-{call}")),
        })
    }

    async fn complete_json(
        &self,
        _prompt: &str,
        _env: &ZellijEnv,
    ) -> Result<serde_json::Value, JellyError> {
        Ok(serde_json::json!({ "renames": [] }))
    }
}

/// An in-process daemon on a temp state directory.
pub struct TestDaemon {
    pub state_dir: PathBuf,
    pub runtime: Arc<FakeRuntime>,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    pub async fn start() -> Self {
        Self::start_with(FakeRuntime::new()).await
    }

    pub async fn start_with(runtime: Arc<FakeRuntime>) -> Self {
        Self::start_seeded(tempfile::tempdir().expect("temp state dir"), runtime).await
    }

    /// Start a daemon over a state directory the test prepared (e.g. a
    /// seeded `state.json`).
    pub async fn start_seeded(dir: tempfile::TempDir, runtime: Arc<FakeRuntime>) -> Self {
        let state_dir = dir.path().to_path_buf();

        let config = DaemonConfig {
            state_dir: state_dir.clone(),
            zellij_session: None,
            heartbeat: HeartbeatConfig {
                enabled: false,
                ..Default::default()
            },
            snapshot_limit: 80,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let daemon = DaemonRuntime::new(config, runtime.clone());
        tokio::spawn(async move {
            let _ = daemon.run(shutdown_rx).await;
        });

        let daemon = Self {
            state_dir,
            runtime,
            shutdown,
            _dir: dir,
        };
        daemon.wait_for_socket().await;
        daemon
    }

    pub fn socket_path(&self) -> PathBuf {
        jelly_types::paths::socket_path(&self.state_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        jelly_types::paths::state_path(&self.state_dir)
    }

    pub fn history_path(&self) -> PathBuf {
        jelly_types::paths::history_path(&self.state_dir)
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn wait_for_socket(&self) {
        let socket = self.socket_path();
        for _ in 0..100 {
            if UnixStream::connect(&socket).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("daemon socket never came up at {}", socket.display());
    }
}

/// One protocol-speaking test connection.
pub struct TestClient {
    writer: OwnedWriteHalf,
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
}

impl TestClient {
    pub async fn connect(socket: &Path) -> Self {
        let stream = UnixStream::connect(socket).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            writer,
            lines: BufReader::new(reader).lines(),
        }
    }

    pub async fn send(&mut self, frame: &ClientFrame) {
        let line = encode_frame(frame).expect("encode");
        self.writer.write_all(line.as_bytes()).await.expect("send");
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("send raw");
        self.writer.write_all(b"\n").await.expect("send raw newline");
    }

    pub async fn recv(&mut self) -> DaemonFrame {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for frame")
            .expect("read error")
            .expect("daemon closed connection");
        serde_json::from_str(&line).expect("parse daemon frame")
    }

    /// Expect silence for `window`.
    pub async fn expect_no_frame(&mut self, window: Duration) {
        match tokio::time::timeout(window, self.lines.next_line()).await {
            Err(_) => {}
            Ok(Ok(Some(line))) => panic!("expected silence, got frame: {line}"),
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }

    /// Register and consume the `registered` + `history_snapshot` pair.
    pub async fn register(
        &mut self,
        client_id: &str,
        zellij_session: Option<&str>,
    ) -> (ModelAlias, bool, Vec<HistoryEntry>) {
        self.send(&ClientFrame::RegisterClient {
            client_id: client_id.into(),
            zellij_session: zellij_session.map(String::from),
            zellij_env: None,
            cwd: None,
            hostname: None,
            pid: Some(std::process::id()),
        })
        .await;

        let (model, busy) = match self.recv().await {
            DaemonFrame::Registered {
                client_id: cid,
                model,
                busy,
                ..
            } => {
                assert_eq!(cid, client_id);
                (model, busy)
            }
            other => panic!("expected registered, got {other:?}"),
        };
        let entries = match self.recv().await {
            DaemonFrame::HistorySnapshot { entries } => entries,
            other => panic!("expected history_snapshot, got {other:?}"),
        };
        (model, busy, entries)
    }

    pub async fn chat(&mut self, request_id: &str, client_id: &str, text: &str) {
        self.chat_in_session(request_id, client_id, text, None).await;
    }

    pub async fn chat_in_session(
        &mut self,
        request_id: &str,
        client_id: &str,
        text: &str,
        zellij_session: Option<&str>,
    ) {
        self.send(&ClientFrame::ChatRequest {
            request_id: request_id.into(),
            client_id: client_id.into(),
            text: text.into(),
            zellij_session: zellij_session.map(String::from),
            zellij_env: None,
        })
        .await;
    }

    /// Collect frames for `request_id` until its `chat_end`, plus any
    /// request-less frames seen along the way.
    pub async fn collect_turn(&mut self, request_id: &str) -> Vec<DaemonFrame> {
        let mut frames = Vec::new();
        loop {
            let frame = self.recv().await;
            let done = matches!(&frame, DaemonFrame::ChatEnd { request_id: rid, .. } if rid == request_id);
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

/// Concatenated `chat_delta` text for one request.
pub fn assistant_text(frames: &[DaemonFrame], request_id: &str) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            DaemonFrame::ChatDelta {
                request_id: rid,
                text,
            } if rid == request_id => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Read the raw history journal lines.
pub fn history_lines(path: &Path) -> Vec<serde_json::Value> {
    let data = std::fs::read_to_string(path).unwrap_or_default();
    data.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("history line parses"))
        .collect()
}
