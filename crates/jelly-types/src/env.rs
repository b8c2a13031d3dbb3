//! Per-request multiplexer environment context.
//!
//! The daemon is detached from the shell that spawned it, so its own
//! process environment says nothing about which zellij session a request
//! came from. Clients capture the identity triple at connect time and the
//! daemon threads it into every subprocess it spawns.

use serde::{Deserialize, Serialize};

/// Environment variable naming the per-session zellij IPC socket.
pub const ZELLIJ_SOCKET_ENV: &str = "ZELLIJ";

/// Environment variable naming the zellij session.
pub const ZELLIJ_SESSION_ENV: &str = "ZELLIJ_SESSION_NAME";

/// Environment variable pinning a specific zellij binary.
pub const ZELLIJ_BIN_ENV: &str = "JELLY_J_ZELLIJ_BIN";

/// The multiplexer identity triple carried per connection and per request.
///
/// Serialized on the wire as a mapping keyed by the recognized variable
/// names, so a client can forward its environment verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZellijEnv {
    /// Per-session IPC socket path.
    #[serde(rename = "ZELLIJ", default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    /// Session name.
    #[serde(
        rename = "ZELLIJ_SESSION_NAME",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_name: Option<String>,
    /// Explicit zellij binary override.
    #[serde(
        rename = "JELLY_J_ZELLIJ_BIN",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub zellij_bin: Option<String>,
}

impl ZellijEnv {
    /// Capture the triple from the current process environment.
    pub fn capture() -> Self {
        let non_empty = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        Self {
            socket_path: non_empty(ZELLIJ_SOCKET_ENV),
            session_name: non_empty(ZELLIJ_SESSION_ENV),
            zellij_bin: non_empty(ZELLIJ_BIN_ENV),
        }
    }

    /// The variables a spawned subprocess needs, as key/value pairs.
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(ref v) = self.socket_path {
            out.push((ZELLIJ_SOCKET_ENV, v.clone()));
        }
        if let Some(ref v) = self.session_name {
            out.push((ZELLIJ_SESSION_ENV, v.clone()));
        }
        if let Some(ref v) = self.zellij_bin {
            out.push((ZELLIJ_BIN_ENV, v.clone()));
        }
        out
    }

    /// The zellij binary to invoke.
    pub fn binary(&self) -> &str {
        self.zellij_bin.as_deref().unwrap_or("zellij")
    }

    /// Fill unset fields from `fallback`, keeping present values.
    pub fn or_else(mut self, fallback: &ZellijEnv) -> Self {
        if self.socket_path.is_none() {
            self.socket_path = fallback.socket_path.clone();
        }
        if self.session_name.is_none() {
            self.session_name = fallback.session_name.clone();
        }
        if self.zellij_bin.is_none() {
            self.zellij_bin = fallback.zellij_bin.clone();
        }
        self
    }

    /// Whether the triple carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self.socket_path.is_none() && self.session_name.is_none() && self.zellij_bin.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ZellijEnv {
        ZellijEnv {
            socket_path: Some("/run/zellij/1000/dev".into()),
            session_name: Some("dev".into()),
            zellij_bin: None,
        }
    }

    #[test]
    fn wire_shape_uses_recognized_keys() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["ZELLIJ"], "/run/zellij/1000/dev");
        assert_eq!(json["ZELLIJ_SESSION_NAME"], "dev");
        assert!(json.get("JELLY_J_ZELLIJ_BIN").is_none());
    }

    #[test]
    fn vars_skips_unset_fields() {
        let vars = sample().vars();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0], (ZELLIJ_SOCKET_ENV, "/run/zellij/1000/dev".into()));
        assert_eq!(vars[1], (ZELLIJ_SESSION_ENV, "dev".into()));
    }

    #[test]
    fn or_else_prefers_present_values() {
        let fallback = ZellijEnv {
            socket_path: Some("/stale".into()),
            session_name: Some("old".into()),
            zellij_bin: Some("/usr/bin/zellij".into()),
        };
        let merged = sample().or_else(&fallback);
        assert_eq!(merged.session_name.as_deref(), Some("dev"));
        assert_eq!(merged.socket_path.as_deref(), Some("/run/zellij/1000/dev"));
        assert_eq!(merged.zellij_bin.as_deref(), Some("/usr/bin/zellij"));
    }

    #[test]
    fn default_binary_when_no_override() {
        assert_eq!(ZellijEnv::default().binary(), "zellij");
        let pinned = ZellijEnv {
            zellij_bin: Some("/opt/zellij".into()),
            ..Default::default()
        };
        assert_eq!(pinned.binary(), "/opt/zellij");
    }

    #[test]
    fn empty_mapping_roundtrips() {
        let empty = ZellijEnv::default();
        assert!(empty.is_empty());
        let json = serde_json::to_string(&empty).unwrap();
        assert_eq!(json, "{}");
        let back: ZellijEnv = serde_json::from_str(&json).unwrap();
        assert!(back.is_empty());
    }
}
