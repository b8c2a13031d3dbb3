//! The daemon runtime: socket server plus the single core task.
//!
//! One core task owns every piece of mutable daemon state: the client
//! registry, the turn queue, the conversation state, the history writer,
//! and the known-sessions set. Connection tasks translate socket I/O into
//! [`CoreMsg`]s; turn execution and heartbeat work run as spawned tasks
//! that report back over the same channel. Nothing is mutated outside the
//! core task, so there is no locking to get wrong.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use jelly_proto::{
    encode_frame, ClientFrame, DaemonFrame, HistoryEntry, Role, MAX_FRAME_BYTES,
};
use jelly_types::{paths, ConversationState, JellyError, ModelAlias, ZellijEnv};

use crate::executor::{run_turn, RoutedFrame, TurnOutcome};
use crate::heartbeat::{run_tick, HeartbeatConfig};
use crate::history::{HistoryStore, DEFAULT_SNAPSHOT_LIMIT};
use crate::lockfile;
use crate::queue::{TurnQueue, TurnRequest};
use crate::registry::{ClientKey, ClientRegistry, Registration, SendOutcome, OUTBOUND_QUEUE_DEPTH};
use crate::runtime::{ChatTurn, ModelRuntime};

/// Total bytes one connection may send; bounds line-buffer growth on a
/// newline-less stream (same tradeoff as capping the line length).
const CONNECTION_READ_CAP: u64 = 64 * 1024 * 1024;

/// Core channel depth; turn tasks, connections, and timers all feed it.
const CORE_QUEUE_DEPTH: usize = 1024;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub state_dir: PathBuf,
    /// Session tag the daemon was started from, recorded in the lock.
    pub zellij_session: Option<String>,
    pub heartbeat: HeartbeatConfig,
    /// History entries replayed on registration.
    pub snapshot_limit: usize,
}

impl DaemonConfig {
    /// Configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            state_dir: paths::state_dir(),
            zellij_session: ZellijEnv::capture().session_name,
            heartbeat: HeartbeatConfig::default(),
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
        }
    }
}

/// How a daemon run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RunExit {
    /// Ran until shutdown was requested.
    Ran,
    /// Another live daemon holds the lock; nothing was started.
    AlreadyRunning,
}

/// Messages into the core task.
enum CoreMsg {
    /// A transport was accepted; its outbound queue is attached.
    Connected {
        key: ClientKey,
        outbound: mpsc::Sender<DaemonFrame>,
    },
    /// A well-formed frame arrived on a transport.
    Frame { key: ClientKey, frame: ClientFrame },
    /// A malformed or oversized line arrived on a transport.
    Malformed { key: ClientKey, message: String },
    /// A transport went away.
    Disconnected { key: ClientKey },
    /// A turn task produced an event for its originating client.
    Emit(RoutedFrame),
    /// A turn task finished.
    TurnDone {
        request: TurnRequest,
        outcome: TurnOutcome,
    },
    /// A heartbeat pass finished.
    HeartbeatDone { drop_sessions: Vec<String> },
}

/// The long-lived daemon process body.
pub struct DaemonRuntime {
    config: DaemonConfig,
    runtime: Arc<dyn ModelRuntime>,
}

impl DaemonRuntime {
    pub fn new(config: DaemonConfig, runtime: Arc<dyn ModelRuntime>) -> Self {
        Self { config, runtime }
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Ordering: lock before socket, socket before accept loop, accept
    /// loop before any history writes. Shutdown runs the same steps in
    /// reverse and releases the lock on every exit path.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<RunExit, JellyError> {
        let outcome = lockfile::acquire_lock(&self.config.state_dir, self.config.zellij_session.clone())?;
        if !outcome.acquired {
            let owner = outcome.owner.map(|o| o.pid).unwrap_or_default();
            info!(owner_pid = owner, "daemon already running; exiting");
            return Ok(RunExit::AlreadyRunning);
        }

        let state_dir = self.config.state_dir.clone();
        let result = self.run_locked(shutdown).await;
        lockfile::release_lock(&state_dir);
        result.map(|_| RunExit::Ran)
    }

    async fn run_locked(self, shutdown: watch::Receiver<bool>) -> Result<(), JellyError> {
        let socket = paths::socket_path(&self.config.state_dir);
        // A socket path surviving under our fresh lock is debris from a
        // prior crash.
        match std::fs::remove_file(&socket) {
            Ok(()) => debug!(path = %socket.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(JellyError::Fatal(format!("cannot clear socket path: {e}"))),
        }

        let listener = UnixListener::bind(&socket)
            .map_err(|e| JellyError::Fatal(format!("cannot bind {}: {e}", socket.display())))?;
        info!(path = %socket.display(), "daemon listening");

        let history = HistoryStore::open(paths::history_path(&self.config.state_dir))?;
        let state = ConversationState::load(&paths::state_path(&self.config.state_dir));

        let (core_tx, core_rx) = mpsc::channel(CORE_QUEUE_DEPTH);
        let accept_task = tokio::spawn(accept_loop(listener, core_tx.clone()));

        let mut core = Core {
            config: self.config,
            runtime: self.runtime,
            registry: ClientRegistry::new(),
            queue: TurnQueue::new(),
            history,
            state,
            known_sessions: HashMap::new(),
            model: ModelAlias::default(),
            core_tx,
            heartbeat_running: false,
        };
        let result = core.run(core_rx, shutdown).await;

        // Reverse of startup: stop accepting, drop connections (their
        // outbound senders die with the registry), remove the socket.
        accept_task.abort();
        drop(core);
        let _ = std::fs::remove_file(&socket);
        info!("daemon stopped");

        result
    }
}

/// Accept connections forever, handing each a transport key and an
/// outbound queue.
async fn accept_loop(listener: UnixListener, core_tx: mpsc::Sender<CoreMsg>) {
    let mut next_key: ClientKey = 1;
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let key = next_key;
                next_key += 1;
                let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
                if core_tx
                    .send(CoreMsg::Connected {
                        key,
                        outbound: outbound_tx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::spawn(handle_connection(stream, key, outbound_rx, core_tx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

/// One task per connection: frames in, frames out, teardown notice at the
/// end. Closing the outbound queue from the core side ends the task and
/// with it the connection.
async fn handle_connection(
    stream: UnixStream,
    key: ClientKey,
    mut outbound: mpsc::Receiver<DaemonFrame>,
    core_tx: mpsc::Sender<CoreMsg>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader.take(CONNECTION_READ_CAP)).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let msg = if line.len() > MAX_FRAME_BYTES {
                        CoreMsg::Malformed {
                            key,
                            message: "frame exceeds maximum length".into(),
                        }
                    } else {
                        match serde_json::from_str::<ClientFrame>(line.trim()) {
                            Ok(frame) => CoreMsg::Frame { key, frame },
                            Err(e) => CoreMsg::Malformed {
                                key,
                                message: format!("malformed frame: {e}"),
                            },
                        }
                    };
                    if core_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let line = match encode_frame(&frame) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(key, error = %e, "dropping unencodable frame");
                            continue;
                        }
                    };
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = core_tx.send(CoreMsg::Disconnected { key }).await;
}

/// The single task owning all mutable daemon state.
struct Core {
    config: DaemonConfig,
    runtime: Arc<dyn ModelRuntime>,
    registry: ClientRegistry,
    queue: TurnQueue,
    history: HistoryStore,
    state: ConversationState,
    /// Sessions accumulated from registrations and chat requests, probed
    /// by the heartbeat.
    known_sessions: HashMap<String, ZellijEnv>,
    model: ModelAlias,
    core_tx: mpsc::Sender<CoreMsg>,
    heartbeat_running: bool,
}

impl Core {
    async fn run(
        &mut self,
        mut core_rx: mpsc::Receiver<CoreMsg>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), JellyError> {
        let hb = &self.config.heartbeat;
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + hb.initial_delay,
            hb.interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let heartbeat_enabled = hb.enabled;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        return Ok(());
                    }
                }
                msg = core_rx.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = self.handle(msg).await {
                            if e.is_fatal() {
                                return Err(e);
                            }
                            warn!(error = %e, "core message failed");
                        }
                    }
                    None => return Ok(()),
                },
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    self.heartbeat_tick();
                }
            }
        }
    }

    async fn handle(&mut self, msg: CoreMsg) -> Result<(), JellyError> {
        match msg {
            CoreMsg::Connected { key, outbound } => {
                self.registry.connect(key, outbound);
                Ok(())
            }
            CoreMsg::Frame { key, frame } => self.handle_frame(key, frame).await,
            CoreMsg::Malformed { key, message } => {
                self.send_to_key(key, DaemonFrame::error(message));
                Ok(())
            }
            CoreMsg::Disconnected { key } => {
                if let Some(reg) = self.registry.disconnect(key) {
                    debug!(client_id = %reg.client_id, "client disconnected");
                }
                Ok(())
            }
            CoreMsg::Emit(routed) => {
                self.route(&routed.client_id, routed.frame);
                Ok(())
            }
            CoreMsg::TurnDone { request, outcome } => self.finish_turn(request, outcome).await,
            CoreMsg::HeartbeatDone { drop_sessions } => {
                self.heartbeat_running = false;
                for tag in drop_sessions {
                    self.known_sessions.remove(&tag);
                }
                Ok(())
            }
        }
    }

    async fn handle_frame(&mut self, key: ClientKey, frame: ClientFrame) -> Result<(), JellyError> {
        // Everything except registration requires a registered transport.
        if !matches!(frame, ClientFrame::RegisterClient { .. }) && !self.registry.is_registered(key)
        {
            self.send_to_key(
                key,
                DaemonFrame::error("not registered: send register_client first"),
            );
            return Ok(());
        }

        match frame {
            ClientFrame::RegisterClient {
                client_id,
                zellij_session,
                zellij_env,
                ..
            } => {
                let env = zellij_env.unwrap_or_default();
                if let Some(ref session) = zellij_session {
                    self.known_sessions.insert(session.clone(), env.clone());
                }
                self.registry.register(
                    key,
                    Registration {
                        client_id: client_id.clone(),
                        zellij_session,
                        env,
                    },
                );
                info!(%client_id, "client registered");

                self.send_to_key(
                    key,
                    DaemonFrame::Registered {
                        client_id,
                        daemon_pid: std::process::id(),
                        model: self.model,
                        busy: self.queue.is_busy(),
                    },
                );
                let entries = self.history.read_snapshot(self.config.snapshot_limit);
                self.send_to_key(key, DaemonFrame::HistorySnapshot { entries });
                Ok(())
            }
            ClientFrame::ChatRequest {
                request_id,
                client_id,
                text,
                zellij_session,
                zellij_env,
            } => {
                // Fall back to the registration's last-seen context so tool
                // subprocesses target the right session even when the
                // request itself carries nothing.
                let registration = self.registry.registration(&client_id);
                let env = zellij_env
                    .clone()
                    .unwrap_or_default()
                    .or_else(&registration.map(|r| r.env.clone()).unwrap_or_default());
                let session = zellij_session
                    .clone()
                    .or_else(|| registration.and_then(|r| r.zellij_session.clone()));

                self.registry
                    .update_context(&client_id, zellij_session, zellij_env);
                if let Some(ref tag) = session {
                    self.known_sessions.insert(tag.clone(), env.clone());
                }

                let queued_ahead =
                    self.queue
                        .enqueue(request_id.clone(), client_id, text, session, env);
                debug!(%request_id, queued_ahead, "turn admitted");
                self.maybe_start_turn().await
            }
            ClientFrame::SetModel {
                request_id, alias, ..
            } => {
                self.model = alias;
                info!(%alias, "model changed");
                let overflowed = self
                    .registry
                    .broadcast(&DaemonFrame::ModelUpdated { request_id, alias });
                for key in overflowed {
                    self.drop_overflowed(key);
                }
                Ok(())
            }
            ClientFrame::NewSession {
                request_id,
                client_id,
                ..
            } => {
                if self.queue.is_busy() {
                    self.route(
                        &client_id,
                        DaemonFrame::request_error(request_id, "a turn is in flight; try again"),
                    );
                    return Ok(());
                }
                self.state.session_id = None;
                if let Err(e) = self.state.save(&paths::state_path(&self.config.state_dir)) {
                    warn!(error = %e, "failed to persist cleared session");
                }
                self.route(
                    &client_id,
                    DaemonFrame::StatusNote {
                        message: "started a fresh conversation; history is kept".into(),
                    },
                );
                Ok(())
            }
            ClientFrame::Ping {
                request_id,
                client_id,
            } => {
                self.route(
                    &client_id,
                    DaemonFrame::Pong {
                        request_id,
                        daemon_pid: std::process::id(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Dequeue and launch the next turn if the executor is idle.
    async fn maybe_start_turn(&mut self) -> Result<(), JellyError> {
        let Some(request) = self.queue.dequeue() else {
            return Ok(());
        };

        // Session-switch detection against the last observed tag.
        let switched = match (&self.state.zellij_session, &request.zellij_session) {
            (Some(last), Some(current)) if last != current => {
                Some((last.clone(), current.clone()))
            }
            _ => None,
        };
        if let Some((ref from, ref to)) = switched {
            self.route(
                &request.client_id,
                DaemonFrame::StatusNote {
                    message: format!("session switched: {from} -> {to}"),
                },
            );
        }

        let now = chrono::Local::now();
        let mut context_prefix = format!(
            "Current time: {} ({}).",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.format("%Z"),
        );
        if let Some((ref from, ref to)) = switched {
            context_prefix.push_str(&format!(
                " The user has moved from zellij session '{from}' to '{to}'; \
                 the workspace state may differ from earlier in this conversation."
            ));
        }

        // History not writable is invariant-threatening: bubble as fatal.
        self.history
            .append(&HistoryEntry::now(
                Role::User,
                request.zellij_session.clone(),
                request.text.clone(),
            ))
            .map_err(|e| JellyError::Fatal(format!("history append failed: {e}")))?;

        self.route(
            &request.client_id,
            DaemonFrame::ChatStart {
                request_id: request.request_id.clone(),
                model: self.model,
                queued_ahead: request.queued_ahead,
            },
        );

        let turn = ChatTurn {
            text: request.text.clone(),
            resume: self.state.session_id.clone(),
            model: self.model,
            context_prefix: Some(context_prefix),
            env: request.env.clone(),
        };

        let runtime = Arc::clone(&self.runtime);
        let core_tx = self.core_tx.clone();
        tokio::spawn(async move {
            let (emit_tx, mut emit_rx) = mpsc::channel::<RoutedFrame>(OUTBOUND_QUEUE_DEPTH);
            let forwarder_tx = core_tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(routed) = emit_rx.recv().await {
                    if forwarder_tx.send(CoreMsg::Emit(routed)).await.is_err() {
                        break;
                    }
                }
            });

            let outcome = run_turn(
                runtime,
                &request.request_id,
                &request.client_id,
                turn,
                emit_tx,
            )
            .await;

            // All emits land before TurnDone, keeping chat_end last.
            let _ = forwarder.await;
            let _ = core_tx.send(CoreMsg::TurnDone { request, outcome }).await;
        });

        Ok(())
    }

    async fn finish_turn(
        &mut self,
        request: TurnRequest,
        outcome: TurnOutcome,
    ) -> Result<(), JellyError> {
        self.state.session_id = outcome.resume.clone();
        if outcome.ok {
            if request.zellij_session.is_some() {
                self.state.zellij_session = request.zellij_session.clone();
            }
        }
        if let Err(e) = self.state.save(&paths::state_path(&self.config.state_dir)) {
            warn!(error = %e, "failed to persist conversation state");
        }

        let history_entry = if outcome.ok {
            if outcome.assistant_text.is_empty() {
                None
            } else {
                Some(HistoryEntry::now(
                    Role::Assistant,
                    request.zellij_session.clone(),
                    outcome.assistant_text.clone(),
                ))
            }
        } else {
            Some(HistoryEntry::now(
                Role::Error,
                request.zellij_session.clone(),
                outcome
                    .error_text
                    .clone()
                    .unwrap_or_else(|| "turn failed".into()),
            ))
        };
        if let Some(entry) = history_entry {
            self.history
                .append(&entry)
                .map_err(|e| JellyError::Fatal(format!("history append failed: {e}")))?;
        }

        self.route(
            &request.client_id,
            DaemonFrame::ChatEnd {
                request_id: request.request_id.clone(),
                ok: outcome.ok,
                model: self.model,
            },
        );

        self.queue.mark_idle();
        self.maybe_start_turn().await
    }

    fn heartbeat_tick(&mut self) {
        if self.heartbeat_running {
            return;
        }
        if self.queue.is_busy() {
            debug!("heartbeat yielding to user traffic");
            return;
        }
        if self.known_sessions.is_empty() {
            return;
        }

        let sessions: Vec<(String, ZellijEnv)> = self
            .known_sessions
            .iter()
            .map(|(tag, env)| (tag.clone(), env.clone()))
            .collect();
        self.heartbeat_running = true;

        let runtime = Arc::clone(&self.runtime);
        let core_tx = self.core_tx.clone();
        tokio::spawn(async move {
            let drop_sessions = run_tick(runtime, sessions).await;
            let _ = core_tx
                .send(CoreMsg::HeartbeatDone { drop_sessions })
                .await;
        });
    }

    /// Route a frame to a registered client; a departed client drops the
    /// frame, an overflowing one is disconnected.
    fn route(&mut self, client_id: &str, frame: DaemonFrame) {
        match self.registry.send_to_client(client_id, frame) {
            SendOutcome::Overflow(key) => self.drop_overflowed(key),
            SendOutcome::Sent | SendOutcome::NoSuchClient => {}
        }
    }

    fn send_to_key(&mut self, key: ClientKey, frame: DaemonFrame) {
        if let SendOutcome::Overflow(key) = self.registry.send_to_key(key, frame) {
            self.drop_overflowed(key);
        }
    }

    /// Drop a client whose outbound queue overflowed. The error frame is
    /// attempted, but a full queue means it usually cannot land; closing
    /// the queue tears the connection down either way.
    fn drop_overflowed(&mut self, key: ClientKey) {
        let _ = self
            .registry
            .send_to_key(key, DaemonFrame::error("outbound queue overflow"));
        if let Some(reg) = self.registry.disconnect(key) {
            warn!(client_id = %reg.client_id, "dropped client on overflow");
        }
    }
}
