//! Model aliases and their underlying runtime identifiers.

use serde::{Deserialize, Serialize};

/// The closed set of conversation models a client may select.
///
/// Aliases are stable protocol vocabulary; the underlying identifiers they
/// map to can move forward without a wire change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelAlias {
    /// Full-strength model used for user turns.
    #[default]
    Opus,
    /// Cheap model used for background suggestions.
    Haiku,
}

impl ModelAlias {
    /// All selectable aliases, in display order.
    pub const ALL: [ModelAlias; 2] = [ModelAlias::Opus, ModelAlias::Haiku];

    /// The alias as it appears on the wire and in `/model` commands.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Haiku => "haiku",
        }
    }

    /// The underlying model identifier passed to the runtime.
    pub fn runtime_id(&self) -> &'static str {
        match self {
            Self::Opus => "claude-opus-4-20250514",
            Self::Haiku => "claude-3-5-haiku-20241022",
        }
    }
}

impl std::fmt::Display for ModelAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelAlias {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "opus" => Ok(Self::Opus),
            "haiku" => Ok(Self::Haiku),
            other => Err(format!(
                "unknown model alias '{other}' (available: opus, haiku)"
            )),
        }
    }
}
