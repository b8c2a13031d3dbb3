//! Persisted conversation state.
//!
//! Written after every turn by write-then-rename so a crash can never leave
//! a half-written file behind.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::JellyError;

/// Contents of `state.json`: what the next daemon start needs to continue
/// the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    /// Resume token issued by the model runtime, absent for a fresh
    /// conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Last observed multiplexer session tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zellij_session: Option<String>,
}

impl ConversationState {
    /// Load persisted state.
    ///
    /// A missing file is a fresh conversation; a corrupt file is discarded
    /// with a warning rather than blocking startup.
    pub fn load(path: &Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&data) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding corrupt state file");
                Self::default()
            }
        }
    }

    /// Persist atomically: write a sibling temp file, then rename over the
    /// target.
    pub fn save(&self, path: &Path) -> Result<(), JellyError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| JellyError::Fatal(format!("failed to serialize state: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = ConversationState::load(&dir.path().join("state.json"));
        assert_eq!(state, ConversationState::default());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = ConversationState {
            session_id: Some("abc-123".into()),
            zellij_session: Some("dev".into()),
        };
        state.save(&path).unwrap();

        let back = ConversationState::load(&path);
        assert_eq!(back, state);
        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let state = ConversationState::load(&path);
        assert_eq!(state, ConversationState::default());
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let state = ConversationState {
            session_id: Some("abc".into()),
            zellij_session: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["sessionId"], "abc");
        assert!(json.get("zellijSession").is_none());
    }
}
