//! History journal entry shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Note,
    Error,
}

/// One line of `history.jsonl`. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    /// Multiplexer session the entry was produced under, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub text: String,
}

impl HistoryEntry {
    /// Build an entry stamped with the current time.
    pub fn now(role: Role, session: Option<String>, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            session,
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
        assert_eq!(serde_json::to_string(&Role::Note).unwrap(), "\"note\"");
        assert_eq!(serde_json::to_string(&Role::Error).unwrap(), "\"error\"");
    }

    #[test]
    fn entry_roundtrip() {
        let entry = HistoryEntry::now(Role::User, Some("dev".into()), "hello");
        let json = serde_json::to_string(&entry).unwrap();
        let back: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn session_omitted_when_absent() {
        let entry = HistoryEntry::now(Role::Note, None, "n");
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("session").is_none());
        assert_eq!(json["role"], "note");
    }
}
