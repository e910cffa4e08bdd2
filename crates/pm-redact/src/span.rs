//! Detector spans and the common span representation.
//!
//! Every detector backend (regex, statistical NER, LLM finder, LLM judge)
//! reports its findings through the same contract: a half-open character
//! range, an entity type, the producing source, and an advisory confidence.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Detector source that produced a span.
///
/// New detector kinds require extending this enumeration; arbitration
/// weights are defined per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Rule-based detection (regex, keyword lists, NER models).
    Deterministic,
    /// LLM finder pass.
    Finder,
    /// LLM judge/verifier pass.
    Judge,
}

impl Source {
    /// All sources, lowest priority first.
    pub const ALL: [Source; 3] = [Source::Deterministic, Source::Finder, Source::Judge];

    /// Vote weight used by arbitration. Confidence is never multiplied in.
    pub fn weight(&self) -> u32 {
        match self {
            Source::Deterministic => 1,
            Source::Finder => 2,
            Source::Judge => 3,
        }
    }

    /// Tie-break priority (judge > finder > deterministic).
    pub fn priority(&self) -> u8 {
        match self {
            Source::Deterministic => 0,
            Source::Finder => 1,
            Source::Judge => 2,
        }
    }

    /// Parse from string.
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "deterministic" | "regex" | "rules" => Some(Source::Deterministic),
            "finder" | "llm_finder" => Some(Source::Finder),
            "judge" | "llm_judge" | "verifier" => Some(Source::Judge),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Deterministic => "deterministic",
            Source::Finder => "finder",
            Source::Judge => "judge",
        };
        write!(f, "{}", s)
    }
}

/// Normalized entity type label (upper snake case, e.g. `PERSON_NAME`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    /// Normalize a raw detector label: `person-name`, `Person Name` and
    /// `PERSON_NAME` all map to `PERSON_NAME`.
    pub fn new(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len());
        let mut pending_sep = false;
        for c in raw.trim().chars() {
            if c.is_ascii_alphanumeric() {
                if pending_sep && !out.is_empty() {
                    out.push('_');
                }
                pending_sep = false;
                out.push(c.to_ascii_uppercase());
            } else {
                pending_sep = true;
            }
        }
        if out.is_empty() {
            out.push_str("UNKNOWN");
        }
        EntityType(out)
    }

    /// The normalized label.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed marker substituted for REDACT decisions.
    pub fn redaction_marker(&self) -> String {
        format!("[REDACTED_{}]", self.0)
    }
}

impl From<String> for EntityType {
    fn from(raw: String) -> Self {
        EntityType::new(&raw)
    }
}

impl From<&str> for EntityType {
    fn from(raw: &str) -> Self {
        EntityType::new(raw)
    }
}

impl From<EntityType> for String {
    fn from(e: EntityType) -> Self {
        e.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A candidate PII span reported by one detector source.
///
/// Offsets are half-open character (Unicode scalar value) ranges into the
/// original text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub entity_type: EntityType,
    pub source: Source,
    #[serde(default = "default_confidence", deserialize_with = "deserialize_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

fn default_confidence() -> f64 {
    1.0
}

fn deserialize_confidence<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    f64::deserialize(deserializer).map(clamp_confidence)
}

impl Span {
    /// Create a span with full confidence and no reasoning.
    pub fn new(start: usize, end: usize, entity_type: impl Into<EntityType>, source: Source) -> Self {
        Self {
            start,
            end,
            entity_type: entity_type.into(),
            source,
            confidence: 1.0,
            reasoning: None,
        }
    }

    /// Set the advisory confidence (clamped to [0, 1]).
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    /// Attach free-form reasoning.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// True for empty or inverted ranges.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether two half-open ranges share at least one character.
    pub fn intersects(&self, other: &Span) -> bool {
        ranges_intersect(self.start, self.end, other.start, other.end)
    }
}

/// Clamp a confidence into [0, 1]; NaN becomes 0.
pub fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

/// Whether half-open ranges `[a0, a1)` and `[b0, b1)` intersect.
pub fn ranges_intersect(a0: usize, a1: usize, b0: usize, b1: usize) -> bool {
    a0 < b1 && b0 < a1
}

/// Mapping between character offsets and byte offsets of one text.
#[derive(Debug, Clone)]
pub struct CharIndex {
    /// Byte offset of each char, plus the total byte length. Empty when
    /// the text is ASCII (identity mapping).
    offsets: Vec<usize>,
    char_len: usize,
    byte_len: usize,
}

impl CharIndex {
    /// Build the index for a text.
    pub fn new(text: &str) -> Self {
        if text.is_ascii() {
            return Self {
                offsets: Vec::new(),
                char_len: text.len(),
                byte_len: text.len(),
            };
        }
        let mut offsets: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        let char_len = offsets.len();
        offsets.push(text.len());
        Self {
            offsets,
            char_len,
            byte_len: text.len(),
        }
    }

    /// Number of characters in the text.
    pub fn char_len(&self) -> usize {
        self.char_len
    }

    /// Byte offset of a char offset. `None` when out of bounds.
    pub fn byte_offset(&self, char_offset: usize) -> Option<usize> {
        if char_offset > self.char_len {
            return None;
        }
        if self.offsets.is_empty() {
            Some(char_offset)
        } else {
            Some(self.offsets[char_offset])
        }
    }

    /// Char offset of a byte offset that lies on a char boundary.
    pub fn char_offset(&self, byte_offset: usize) -> Option<usize> {
        if byte_offset > self.byte_len {
            return None;
        }
        if self.offsets.is_empty() {
            return Some(byte_offset);
        }
        self.offsets.binary_search(&byte_offset).ok()
    }

    /// Slice `text` by a character range. `None` when out of bounds.
    pub fn slice<'t>(&self, text: &'t str, start: usize, end: usize) -> Option<&'t str> {
        if start > end {
            return None;
        }
        let b0 = self.byte_offset(start)?;
        let b1 = self.byte_offset(end)?;
        text.get(b0..b1)
    }
}
