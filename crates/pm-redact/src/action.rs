//! Redaction actions.

use serde::{Deserialize, Serialize};

/// Action to apply to a decided span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Replace with a fixed `[REDACTED_<TYPE>]` marker.
    Redact,
    /// Replace with a stable run-scoped pseudonym token.
    Pseudonymize,
    /// Leave the original text untouched.
    Retain,
}

impl Action {
    /// Parse an action from a string (case-insensitive).
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REDACT" => Some(Action::Redact),
            "PSEUDONYMIZE" => Some(Action::Pseudonymize),
            "RETAIN" => Some(Action::Retain),
            _ => None,
        }
    }

    /// Returns whether this action modifies the text.
    pub fn is_modifying(&self) -> bool {
        !matches!(self, Action::Retain)
    }

    /// Protection rank: higher never discloses more than lower.
    pub fn protection_rank(&self) -> u8 {
        match self {
            Action::Retain => 0,
            Action::Pseudonymize => 1,
            Action::Redact => 2,
        }
    }

    /// The more protective of two actions.
    pub fn most_protective(self, other: Action) -> Action {
        if other.protection_rank() > self.protection_rank() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Redact => "REDACT",
            Action::Pseudonymize => "PSEUDONYMIZE",
            Action::Retain => "RETAIN",
        };
        write!(f, "{}", s)
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::Retain // Unmatched entity types are not redacted
    }
}
