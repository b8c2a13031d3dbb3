//! Turn execution: one model conversation turn, events out, outcome back.
//!
//! The executor owns the retry policy the adapter deliberately does not
//! have: a structured stale-conversation failure that arrives before any
//! assistant text is buffered (never forwarded), the resume token is
//! dropped, and the same turn runs once more against a fresh conversation.
//! Unmatched failures are never retried.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use jelly_proto::DaemonFrame;
use jelly_types::{matches_stale_resume, JellyError};

use crate::runtime::{ChatEvent, ChatTurn, ModelRuntime};

/// A frame addressed to the turn's originating client. The core task owns
/// the registry and does the actual routing.
#[derive(Debug)]
pub struct RoutedFrame {
    pub client_id: String,
    pub frame: DaemonFrame,
}

/// What one finished turn reports back to the core task.
#[derive(Debug)]
pub struct TurnOutcome {
    /// No structured errors and no adapter exception.
    pub ok: bool,
    /// Token to persist for the next turn.
    pub resume: Option<String>,
    /// Accumulated assistant text across all deltas.
    pub assistant_text: String,
    /// Surfaced error text for the history journal, when not ok.
    pub error_text: Option<String>,
    /// Whether the stale-resume recovery path ran.
    pub stale_retried: bool,
}

/// Run one turn to completion, streaming frames to `emit`.
///
/// `turn.resume` is the token held at dequeue; the returned outcome carries
/// the token to persist. This function never returns an error: adapter
/// failures become `error` frames plus `ok: false`.
pub async fn run_turn(
    runtime: Arc<dyn ModelRuntime>,
    request_id: &str,
    client_id: &str,
    mut turn: ChatTurn,
    emit: mpsc::Sender<RoutedFrame>,
) -> TurnOutcome {
    let mut retried = false;

    loop {
        let attempt = Attempt::run(
            runtime.as_ref(),
            request_id,
            client_id,
            turn.clone(),
            &emit,
            retried,
        )
        .await;

        if attempt.retry_fresh {
            info!(request_id, "stale resume detected; retrying with a fresh conversation");
            send(
                &emit,
                client_id,
                DaemonFrame::StatusNote {
                    message: "previous conversation could not be resumed; starting a fresh one"
                        .into(),
                },
            )
            .await;
            turn.resume = None;
            retried = true;
            continue;
        }

        return TurnOutcome {
            ok: attempt.ok,
            resume: attempt.resume.or_else(|| turn.resume.clone()),
            assistant_text: attempt.assistant_text,
            error_text: attempt.error_text,
            stale_retried: retried,
        };
    }
}

/// One adapter invocation and its bookkeeping.
struct Attempt {
    ok: bool,
    resume: Option<String>,
    assistant_text: String,
    error_text: Option<String>,
    retry_fresh: bool,
}

impl Attempt {
    async fn run(
        runtime: &dyn ModelRuntime,
        request_id: &str,
        client_id: &str,
        turn: ChatTurn,
        emit: &mpsc::Sender<RoutedFrame>,
        already_retried: bool,
    ) -> Attempt {
        let held_resume = turn.resume.is_some();
        let (event_tx, mut event_rx) = mpsc::channel::<ChatEvent>(64);

        let chat = runtime.chat(turn, event_tx);
        tokio::pin!(chat);

        let mut assistant_text = String::new();
        let mut text_emitted = false;
        let mut error_count = 0usize;
        let mut last_error: Option<String> = None;
        let mut stale_buffered = false;
        let mut chat_result: Option<Result<crate::runtime::ChatOutcome, JellyError>> = None;

        // Pump events and the chat future together. The event sender drops
        // when the adapter returns, so the recv arm always terminates; any
        // events still buffered at completion are drained before exit.
        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => {
                        handle_event(
                            event,
                            request_id,
                            client_id,
                            emit,
                            &mut assistant_text,
                            &mut text_emitted,
                            &mut error_count,
                            &mut last_error,
                            &mut stale_buffered,
                            held_resume && !already_retried,
                        )
                        .await;
                    }
                    None => break,
                },
                result = &mut chat, if chat_result.is_none() => {
                    chat_result = Some(result);
                }
            }
        }
        let chat_result = match chat_result {
            Some(result) => result,
            None => chat.await,
        };

        match chat_result {
            Ok(outcome) => {
                if stale_buffered {
                    return Attempt {
                        ok: false,
                        resume: None,
                        assistant_text: String::new(),
                        error_text: None,
                        retry_fresh: true,
                    };
                }
                Attempt {
                    ok: error_count == 0,
                    resume: outcome.resume,
                    assistant_text,
                    error_text: last_error,
                    retry_fresh: false,
                }
            }
            Err(e) => {
                let text = e.to_string();
                let stale = matches!(e, JellyError::StaleResume(_)) || matches_stale_resume(&text);
                if stale && !text_emitted && held_resume && !already_retried {
                    debug!(request_id, error = %text, "buffering stale-resume failure");
                    return Attempt {
                        ok: false,
                        resume: None,
                        assistant_text: String::new(),
                        error_text: None,
                        retry_fresh: true,
                    };
                }
                send(
                    emit,
                    client_id,
                    DaemonFrame::request_error(request_id, text.clone()),
                )
                .await;
                Attempt {
                    ok: false,
                    resume: None,
                    assistant_text,
                    error_text: Some(text),
                    retry_fresh: false,
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_event(
    event: ChatEvent,
    request_id: &str,
    client_id: &str,
    emit: &mpsc::Sender<RoutedFrame>,
    assistant_text: &mut String,
    text_emitted: &mut bool,
    error_count: &mut usize,
    last_error: &mut Option<String>,
    stale_buffered: &mut bool,
    stale_recovery_armed: bool,
) {
    match event {
        ChatEvent::Text(text) => {
            *text_emitted = true;
            assistant_text.push_str(&text);
            send(
                emit,
                client_id,
                DaemonFrame::ChatDelta {
                    request_id: request_id.into(),
                    text,
                },
            )
            .await;
        }
        ChatEvent::ToolUse { name } => {
            send(
                emit,
                client_id,
                DaemonFrame::ToolUse {
                    request_id: request_id.into(),
                    name,
                },
            )
            .await;
        }
        ChatEvent::ResultError { subtype, errors } => {
            let joined = errors.join("; ");
            let stale = matches_stale_resume(&joined) || matches_stale_resume(&subtype);
            if stale && stale_recovery_armed && !*text_emitted && !*stale_buffered {
                // Held back from the client; the retry decision happens
                // once the adapter returns.
                *stale_buffered = true;
                return;
            }
            *error_count += 1;
            *last_error = Some(joined);
            send(
                emit,
                client_id,
                DaemonFrame::ResultError {
                    request_id: request_id.into(),
                    subtype,
                    errors,
                },
            )
            .await;
        }
        ChatEvent::PermissionRequest { tool, reason } => {
            send(
                emit,
                client_id,
                DaemonFrame::StatusNote {
                    message: format!("permission required for {tool}: {reason}"),
                },
            )
            .await;
        }
    }
}

async fn send(emit: &mpsc::Sender<RoutedFrame>, client_id: &str, frame: DaemonFrame) {
    let _ = emit
        .send(RoutedFrame {
            client_id: client_id.into(),
            frame,
        })
        .await;
}
