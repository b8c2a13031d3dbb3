//! Control-plane protocol tests against an in-process daemon.

mod common;

use std::time::Duration;

use common::{assistant_text, history_lines, TestClient, TestDaemon};
use jelly_daemon::heartbeat::HeartbeatConfig;
use jelly_daemon::{DaemonConfig, DaemonRuntime, RunExit};
use jelly_proto::{ClientFrame, DaemonFrame};
use jelly_types::ModelAlias;

#[tokio::test]
async fn happy_path_turn() {
    let daemon = TestDaemon::start().await;
    let mut c1 = TestClient::connect(&daemon.socket_path()).await;

    let (model, busy, entries) = c1.register("c1", None).await;
    assert_eq!(model, ModelAlias::Opus);
    assert!(!busy);
    assert!(entries.is_empty());

    c1.chat("r1", "c1", "hi").await;
    let frames = c1.collect_turn("r1").await;

    match &frames[0] {
        DaemonFrame::ChatStart {
            request_id,
            model,
            queued_ahead,
        } => {
            assert_eq!(request_id, "r1");
            assert_eq!(*model, ModelAlias::Opus);
            assert_eq!(*queued_ahead, 0);
        }
        other => panic!("expected chat_start first, got {other:?}"),
    }
    assert_eq!(assistant_text(&frames, "r1"), "echo: hi");
    match frames.last().unwrap() {
        DaemonFrame::ChatEnd { ok, model, .. } => {
            assert!(ok);
            assert_eq!(*model, ModelAlias::Opus);
        }
        other => panic!("expected chat_end last, got {other:?}"),
    }

    // History gained one user entry and one assistant entry, in order.
    let lines = history_lines(&daemon.history_path());
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["role"], "user");
    assert_eq!(lines[0]["text"], "hi");
    assert_eq!(lines[1]["role"], "assistant");
    assert_eq!(lines[1]["text"], "echo: hi");
}

#[tokio::test]
async fn frames_before_registration_are_rejected() {
    let daemon = TestDaemon::start().await;
    let mut client = TestClient::connect(&daemon.socket_path()).await;

    client.chat("r1", "c1", "hello").await;
    match client.recv().await {
        DaemonFrame::Error { message, .. } => {
            assert!(message.contains("register"), "got: {message}");
        }
        other => panic!("expected error frame, got {other:?}"),
    }

    // Exactly one error, then silence until a valid registration.
    client.expect_no_frame(Duration::from_millis(200)).await;

    let (_, _, _) = client.register("c1", None).await;
}

#[tokio::test]
async fn malformed_frame_gets_error_and_connection_survives() {
    let daemon = TestDaemon::start().await;
    let mut client = TestClient::connect(&daemon.socket_path()).await;

    client.send_raw("{this is not json").await;
    match client.recv().await {
        DaemonFrame::Error { message, .. } => {
            assert!(message.contains("malformed"), "got: {message}");
        }
        other => panic!("expected error frame, got {other:?}"),
    }

    client.send_raw(r#"{"type":"bogus_frame"}"#).await;
    assert!(matches!(client.recv().await, DaemonFrame::Error { .. }));

    // The connection is still usable.
    client.register("c1", None).await;
}

#[tokio::test]
async fn ping_yields_pong_with_daemon_pid() {
    let daemon = TestDaemon::start().await;
    let mut client = TestClient::connect(&daemon.socket_path()).await;
    client.register("c1", None).await;

    client
        .send(&ClientFrame::Ping {
            request_id: "p1".into(),
            client_id: "c1".into(),
        })
        .await;

    match client.recv().await {
        DaemonFrame::Pong {
            request_id,
            daemon_pid,
        } => {
            assert_eq!(request_id, "p1");
            // The daemon runs in-process here.
            assert_eq!(daemon_pid, std::process::id());
        }
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn set_model_broadcasts_to_all_clients_and_is_idempotent() {
    let daemon = TestDaemon::start().await;
    let mut c1 = TestClient::connect(&daemon.socket_path()).await;
    let mut c2 = TestClient::connect(&daemon.socket_path()).await;
    c1.register("c1", None).await;
    c2.register("c2", None).await;

    for round in ["m1", "m2"] {
        c1.send(&ClientFrame::SetModel {
            request_id: round.into(),
            client_id: "c1".into(),
            alias: ModelAlias::Haiku,
        })
        .await;

        for client in [&mut c1, &mut c2] {
            match client.recv().await {
                DaemonFrame::ModelUpdated { request_id, alias } => {
                    assert_eq!(request_id, round);
                    assert_eq!(alias, ModelAlias::Haiku);
                }
                other => panic!("expected model_updated, got {other:?}"),
            }
        }
    }

    // The new alias is what later turns run with.
    c1.chat("r1", "c1", "check").await;
    let frames = c1.collect_turn("r1").await;
    assert!(matches!(
        &frames[0],
        DaemonFrame::ChatStart {
            model: ModelAlias::Haiku,
            ..
        }
    ));
}

#[tokio::test]
async fn registration_replays_bounded_history() {
    let daemon = TestDaemon::start().await;
    let mut c1 = TestClient::connect(&daemon.socket_path()).await;
    c1.register("c1", None).await;
    c1.chat("r1", "c1", "first").await;
    c1.collect_turn("r1").await;

    // A late joiner sees the journal in order.
    let mut c2 = TestClient::connect(&daemon.socket_path()).await;
    let (_, _, entries) = c2.register("c2", None).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].text, "first");
    assert_eq!(entries[1].text, "echo: first");
}

#[tokio::test]
async fn second_daemon_on_same_state_dir_defers() {
    let daemon = TestDaemon::start().await;

    let config = DaemonConfig {
        state_dir: daemon.state_dir.clone(),
        zellij_session: None,
        heartbeat: HeartbeatConfig {
            enabled: false,
            ..Default::default()
        },
        snapshot_limit: 80,
    };
    let (_tx, rx) = tokio::sync::watch::channel(false);
    let second = DaemonRuntime::new(config, common::FakeRuntime::new());

    let exit = second.run(rx).await.expect("second daemon run");
    assert_eq!(exit, RunExit::AlreadyRunning);

    // The first daemon is untouched.
    let mut client = TestClient::connect(&daemon.socket_path()).await;
    client.register("c1", None).await;
}
