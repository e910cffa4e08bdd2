//! Canonicalization of entity values before keyed hashing.
//!
//! Two surface forms of the same entity (`John  Doe` / `john doe`,
//! `+1 (555) 123-4567` / `+15551234567`) must map to the same pseudonym,
//! so values are normalized per entity type before they reach the registry
//! or the policy exception lists.

use crate::span::EntityType;
use once_cell::sync::Lazy;
use regex::Regex;

/// Current canonicalization version. Changes when rules are modified.
pub const CANONICALIZATION_VERSION: &str = "1.0.0";

static RE_MULTIPLE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Trailing punctuation detectors tend to include in a span.
static RE_TRAILING_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.,;:!?]+$").unwrap());

/// Canonical form family chosen from the entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    Email,
    Phone,
    Host,
    Text,
}

fn form_for(entity_type: &EntityType) -> Form {
    let s = entity_type.as_str();
    if s.contains("EMAIL") {
        Form::Email
    } else if s.contains("PHONE") {
        Form::Phone
    } else if s.contains("HOST") || s.contains("DOMAIN") || s == "IP" || s.starts_with("IP_") {
        Form::Host
    } else {
        Form::Text
    }
}

/// Canonicalizer for entity values.
#[derive(Debug, Clone, Default)]
pub struct Canonicalizer {
    _private: (),
}

impl Canonicalizer {
    /// Create a new canonicalizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize a value of the given entity type.
    ///
    /// - all values are trimmed and lowercased
    /// - phone numbers keep only digits (and a leading `+`)
    /// - email and host values drop trailing punctuation
    /// - everything else collapses internal whitespace
    pub fn canonicalize(&self, entity_type: &EntityType, value: &str) -> String {
        let trimmed = value.trim();
        match form_for(entity_type) {
            Form::Phone => {
                let mut out = String::with_capacity(trimmed.len());
                if trimmed.starts_with('+') {
                    out.push('+');
                }
                out.extend(trimmed.chars().filter(|c| c.is_ascii_digit()));
                if out.is_empty() || out == "+" {
                    // Not a digit string; fall back to text form.
                    return collapse(trimmed);
                }
                out
            }
            Form::Email | Form::Host => RE_TRAILING_PUNCT.replace(trimmed, "").to_lowercase(),
            Form::Text => collapse(trimmed),
        }
    }
}

fn collapse(value: &str) -> String {
    RE_MULTIPLE_SPACES.replace_all(value, " ").to_lowercase()
}
