//! Blocking probe client for the daemon socket.
//!
//! Used by the startup supervisor to decide whether a healthy daemon is
//! already listening. The probe performs the same handshake a UI client
//! would (`register_client` + `ping`) so that "socket exists" is never
//! mistaken for "daemon alive".

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

use jelly_types::JellyError;

use crate::frames::{encode_frame, ClientFrame, DaemonFrame};

/// Blocking client that speaks just enough of the protocol to probe health.
pub struct ProbeClient {
    socket_path: PathBuf,
}

impl ProbeClient {
    /// Create a probe client targeting the given socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// The socket path this client targets.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Complete a `register_client` + `ping` round-trip within `timeout`.
    ///
    /// Returns the daemon pid reported by the `pong`. Any missing or
    /// out-of-order frame is a protocol error; a slow or absent daemon
    /// surfaces as a timeout or io error.
    pub fn probe(&self, timeout: Duration) -> Result<u32, JellyError> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        let client_id = format!("probe-{}", Uuid::new_v4());
        let request_id = format!("probe-ping-{}", Uuid::new_v4());

        self.send(
            &mut writer,
            &ClientFrame::RegisterClient {
                client_id: client_id.clone(),
                zellij_session: None,
                zellij_env: None,
                cwd: None,
                hostname: None,
                pid: Some(std::process::id()),
            },
        )?;

        match self.read_frame(&mut reader)? {
            DaemonFrame::Registered { .. } => {}
            other => {
                return Err(JellyError::Protocol(format!(
                    "expected registered, got {other:?}"
                )))
            }
        }
        match self.read_frame(&mut reader)? {
            DaemonFrame::HistorySnapshot { .. } => {}
            other => {
                return Err(JellyError::Protocol(format!(
                    "expected history_snapshot, got {other:?}"
                )))
            }
        }

        self.send(
            &mut writer,
            &ClientFrame::Ping {
                request_id: request_id.clone(),
                client_id,
            },
        )?;

        match self.read_frame(&mut reader)? {
            DaemonFrame::Pong {
                request_id: rid,
                daemon_pid,
            } if rid == request_id => Ok(daemon_pid),
            other => Err(JellyError::Protocol(format!(
                "expected pong for {request_id}, got {other:?}"
            ))),
        }
    }

    /// Whether a daemon answers the probe within `timeout`.
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        self.probe(timeout).is_ok()
    }

    fn send(&self, writer: &mut UnixStream, frame: &ClientFrame) -> Result<(), JellyError> {
        let line = encode_frame(frame)?;
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn read_frame(&self, reader: &mut BufReader<UnixStream>) -> Result<DaemonFrame, JellyError> {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(JellyError::Protocol(
                "daemon closed the connection mid-handshake".into(),
            ));
        }
        serde_json::from_str(&line)
            .map_err(|e| JellyError::Protocol(format!("unparseable frame from daemon: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_fails_cleanly_when_no_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let client = ProbeClient::new(dir.path().join("daemon.sock"));
        assert!(!client.is_healthy(Duration::from_millis(200)));
        match client.probe(Duration::from_millis(200)) {
            Err(JellyError::Io(_)) => {}
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn probe_rejects_silent_listener() {
        // A socket that accepts but never answers must not count as healthy.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let handle = std::thread::spawn(move || {
            // Hold the connection open without responding.
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(400));
            drop(stream);
        });

        let client = ProbeClient::new(&path);
        assert!(!client.is_healthy(Duration::from_millis(100)));
        handle.join().unwrap();
    }
}
