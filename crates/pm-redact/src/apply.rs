//! Applying decisions to the source text.
//!
//! Replacements are computed against the original text, then spliced in
//! right to left so that every pending byte offset stays valid. Output
//! character ranges are computed left to right from the cumulative length
//! change, giving the validator an exact map of what the applier wrote.

use crate::arbitrate::{Decision, TextRange};
use crate::error::{RedactionError, Result};
use crate::pseudonym::PseudonymRegistry;
use crate::span::{CharIndex, EntityType};
use crate::structured::{leaf_strings, unescape_fragment, LeafString};
use crate::Action;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One substitution written into the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    /// Index of the originating decision.
    pub decision: usize,
    pub entity_type: EntityType,
    pub action: Action,
    /// Range replaced in the original text, in characters.
    pub original: TextRange,
    /// Range of the substituted text in the output, in characters.
    pub output: TextRange,
    /// Marker or token that was written.
    pub replacement: String,
}

/// A modifying decision that could not be applied because it touched no
/// JSON leaf string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedStructure {
    pub decision: usize,
    pub span: TextRange,
    pub entity_type: EntityType,
}

/// Output of the applier.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub processed_text: String,
    /// Replacements in ascending original order.
    pub replacements: Vec<Replacement>,
    pub protected: Vec<ProtectedStructure>,
    /// Whether the input was treated as structured JSON.
    pub structured: bool,
}

impl ApplyOutcome {
    /// Map an original character offset to the output, for offsets that
    /// lie outside every replaced range.
    pub fn map_offset(&self, original: usize) -> usize {
        let mut delta: isize = 0;
        for r in &self.replacements {
            if r.original.end <= original {
                delta += r.output.len() as isize - r.original.len() as isize;
            } else {
                break;
            }
        }
        (original as isize + delta).max(0) as usize
    }
}

struct Segment {
    decision: usize,
    byte_start: usize,
    byte_end: usize,
}

/// Rewrites text according to a non-overlapping decision set.
pub struct RedactionApplier<'r> {
    registry: &'r PseudonymRegistry,
}

impl<'r> RedactionApplier<'r> {
    pub fn new(registry: &'r PseudonymRegistry) -> Self {
        Self { registry }
    }

    /// Apply `decisions` (ordered by start, pairwise non-overlapping) to `text`.
    pub fn apply(&self, text: &str, index: &CharIndex, decisions: &[Decision]) -> Result<ApplyOutcome> {
        let leaves = leaf_strings(text);
        let structured = leaves.is_some();

        let mut segments: Vec<Segment> = Vec::new();
        let mut protected = Vec::new();

        for (i, d) in decisions.iter().enumerate() {
            if !d.action.is_modifying() {
                continue;
            }
            let (b0, b1) = match (index.byte_offset(d.span.start), index.byte_offset(d.span.end)) {
                (Some(b0), Some(b1)) if b0 < b1 => (b0, b1),
                _ => {
                    warn!(start = d.span.start, end = d.span.end, "decision outside text bounds skipped");
                    continue;
                }
            };
            match &leaves {
                None => segments.push(Segment {
                    decision: i,
                    byte_start: b0,
                    byte_end: b1,
                }),
                Some(leaves) => {
                    let before = segments.len();
                    segments.extend(structured_segments(leaves, i, b0, b1));
                    if segments.len() == before {
                        debug!(
                            start = d.span.start,
                            end = d.span.end,
                            entity_type = %d.entity_type,
                            "decision touches no JSON string value; not applied"
                        );
                        protected.push(ProtectedStructure {
                            decision: i,
                            span: d.span,
                            entity_type: d.entity_type.clone(),
                        });
                    }
                }
            }
        }

        segments.sort_by_key(|s| s.byte_start);
        // Escape widening may make neighbouring segments touch; clamp so
        // each byte is replaced at most once.
        let mut prev_end = 0;
        segments.retain_mut(|s| {
            if s.byte_start < prev_end {
                s.byte_start = prev_end;
            }
            if s.byte_start >= s.byte_end {
                return false;
            }
            prev_end = s.byte_end;
            true
        });

        let mut replacements = Vec::with_capacity(segments.len());
        let mut char_delta: isize = 0;
        for seg in &segments {
            let d = &decisions[seg.decision];
            let raw = text
                .get(seg.byte_start..seg.byte_end)
                .ok_or_else(RedactionError::internal)?;
            // JSON leaves are keyed by their decoded value.
            let original_value = if leaves.is_some() {
                unescape_fragment(raw)
            } else {
                raw.into()
            };
            let replacement = match d.action {
                Action::Redact => d.entity_type.redaction_marker(),
                Action::Pseudonymize => self.registry.token_for(&d.entity_type, &original_value)?,
                Action::Retain => continue,
            };
            let c0 = index.char_offset(seg.byte_start).ok_or_else(RedactionError::internal)?;
            let c1 = index.char_offset(seg.byte_end).ok_or_else(RedactionError::internal)?;
            let out_start = (c0 as isize + char_delta) as usize;
            let out_len = replacement.chars().count();
            char_delta += out_len as isize - (c1 - c0) as isize;
            replacements.push((
                seg,
                Replacement {
                    decision: seg.decision,
                    entity_type: d.entity_type.clone(),
                    action: d.action,
                    original: TextRange::new(c0, c1),
                    output: TextRange::new(out_start, out_start + out_len),
                    replacement,
                },
            ));
        }

        let mut processed_text = text.to_string();
        for (seg, r) in replacements.iter().rev() {
            processed_text.replace_range(seg.byte_start..seg.byte_end, &r.replacement);
        }

        Ok(ApplyOutcome {
            processed_text,
            replacements: replacements.into_iter().map(|(_, r)| r).collect(),
            protected,
            structured,
        })
    }
}

fn structured_segments(leaves: &[LeafString], decision: usize, b0: usize, b1: usize) -> Vec<Segment> {
    leaves
        .iter()
        .filter(|l| l.start < b1 && b0 < l.end)
        .filter_map(|l| l.clip(b0, b1))
        .map(|(s, e)| Segment {
            decision,
            byte_start: s,
            byte_end: e,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrate::Rationale;
    use crate::hash::KeyMaterial;

    fn decision(start: usize, end: usize, et: &str, action: Action) -> Decision {
        Decision {
            span: TextRange::new(start, end),
            entity_type: EntityType::new(et),
            action,
            category: None,
            sensitivity_level: None,
            vote_breakdown: Vec::new(),
            rationale: Rationale::default(),
            sources: Vec::new(),
        }
    }

    fn registry() -> PseudonymRegistry {
        PseudonymRegistry::new(KeyMaterial::from_salt("apply-tests", "t").unwrap())
    }

    fn apply(text: &str, decisions: &[Decision], reg: &PseudonymRegistry) -> ApplyOutcome {
        RedactionApplier::new(reg)
            .apply(text, &CharIndex::new(text), decisions)
            .unwrap()
    }

    #[test]
    fn test_redact_markers() {
        let text = "Contact: john.doe@company.com, Phone: +1-555-123-4567";
        let reg = registry();
        let out = apply(
            text,
            &[
                decision(9, 29, "EMAIL", Action::Redact),
                decision(38, 53, "PHONE", Action::Redact),
            ],
            &reg,
        );
        assert_eq!(out.processed_text, "Contact: [REDACTED_EMAIL], Phone: [REDACTED_PHONE]");
        assert_eq!(out.replacements.len(), 2);
        assert_eq!(out.replacements[0].output, TextRange::new(9, 25));
        assert_eq!(out.replacements[1].output, TextRange::new(34, 50));
        assert!(!out.structured);
    }

    #[test]
    fn test_retain_leaves_text() {
        let text = "on host db-7";
        let reg = registry();
        let out = apply(text, &[decision(8, 12, "HOST", Action::Retain)], &reg);
        assert_eq!(out.processed_text, text);
        assert!(out.replacements.is_empty());
    }

    #[test]
    fn test_pseudonym_reused_for_same_value() {
        let text = "John Smith paged; john  smith acked";
        let reg = registry();
        let out = apply(
            text,
            &[
                decision(0, 10, "PERSON", Action::Pseudonymize),
                decision(18, 29, "PERSON", Action::Pseudonymize),
            ],
            &reg,
        );
        let a = &out.replacements[0].replacement;
        let b = &out.replacements[1].replacement;
        assert_eq!(a, b);
        assert!(a.starts_with("Person_"));
        assert_eq!(out.processed_text, format!("{} paged; {} acked", a, a));
    }

    #[test]
    fn test_multibyte_offsets() {
        let text = "Zoë → José";
        let reg = registry();
        let out = apply(
            text,
            &[
                decision(0, 3, "PERSON", Action::Redact),
                decision(6, 10, "PERSON", Action::Redact),
            ],
            &reg,
        );
        assert_eq!(out.processed_text, "[REDACTED_PERSON] → [REDACTED_PERSON]");
        assert_eq!(out.map_offset(4), 18);
    }

    #[test]
    fn test_escaped_json_value_shares_token_with_plain_text() {
        let reg = registry();
        let json = r#"{"owner": "Jos\u00e9"}"#;
        let structured = apply(json, &[decision(11, 20, "PERSON", Action::Pseudonymize)], &reg);
        let plain = apply("José", &[decision(0, 4, "PERSON", Action::Pseudonymize)], &reg);
        assert!(structured.structured);
        assert_eq!(structured.replacements[0].replacement, plain.replacements[0].replacement);
        assert_eq!(reg.len().unwrap(), 1);
    }

    #[test]
    fn test_json_keys_and_punctuation_untouched() {
        let text = r#"{"email": "a@b.io", "n": 1}"#;
        let reg = registry();
        // Decision covering the whole `"email": "a@b.io"` member.
        let out = apply(text, &[decision(1, 18, "EMAIL", Action::Redact)], &reg);
        assert_eq!(out.processed_text, r#"{"email": "[REDACTED_EMAIL]", "n": 1}"#);
        assert!(out.structured);
        let parsed: serde_json::Value = serde_json::from_str(&out.processed_text).unwrap();
        assert_eq!(parsed["n"], 1);
    }

    #[test]
    fn test_json_decision_on_key_is_protected() {
        let text = r#"{"secret": "x"}"#;
        let reg = registry();
        let out = apply(text, &[decision(2, 8, "API_KEY", Action::Redact)], &reg);
        assert_eq!(out.processed_text, text);
        assert_eq!(out.protected.len(), 1);
    }

    #[test]
    fn test_json_escape_not_split() {
        let text = r#"{"note": "call\nJohn"}"#;
        let reg = registry();
        // Span starts at the 'n' of "\n".
        let n_pos = text.find(r"\n").unwrap() + 1;
        let out = apply(text, &[decision(n_pos, n_pos + 5, "PERSON", Action::Redact)], &reg);
        assert_eq!(out.processed_text, r#"{"note": "call[REDACTED_PERSON]"}"#);
        assert!(serde_json::from_str::<serde_json::Value>(&out.processed_text).is_ok());
    }
}
