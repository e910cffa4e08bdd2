//! Built-in pattern scanner.
//!
//! A small set of regular expressions for the structured PII formats that
//! must never survive redaction: email addresses, phone numbers, SSNs, card
//! numbers, IPv4 addresses, API keys/tokens and customer identifiers. It
//! serves both as the default residual scanner of the quality validator and
//! as a deterministic detector source for the driver.

use crate::span::{CharIndex, EntityType, Source, Span};
use crate::validate::ResidualScanner;
use once_cell::sync::Lazy;
use regex::Regex;

/// Detection pattern definition.
struct DetectionPattern {
    entity_type: &'static str,
    pattern: Lazy<Regex>,
    description: &'static str,
}

// Listed in precedence order; earlier patterns win overlapping matches of
// equal length.
static PATTERNS: [DetectionPattern; 7] = [
    DetectionPattern {
        entity_type: "API_KEY",
        pattern: Lazy::new(|| {
            Regex::new(concat!(
                r"AKIA[0-9A-Z]{16}",
                r"|gh[pousr]_[A-Za-z0-9_]{36,}",
                r"|glpat-[A-Za-z0-9\-_]{20,}",
                r"|xox[baprs]-[A-Za-z0-9\-]+",
                r"|eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+",
                r"|sk-(?:ant-)?[A-Za-z0-9_-]{20,}",
            ))
            .unwrap()
        }),
        description: "API keys and access tokens",
    },
    DetectionPattern {
        entity_type: "EMAIL",
        pattern: Lazy::new(|| {
            Regex::new(r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b").unwrap()
        }),
        description: "Email address",
    },
    DetectionPattern {
        entity_type: "CREDIT_CARD",
        pattern: Lazy::new(|| Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b").unwrap()),
        description: "Payment card number",
    },
    DetectionPattern {
        entity_type: "SSN",
        pattern: Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap()),
        description: "US Social Security Number",
    },
    DetectionPattern {
        entity_type: "IP_ADDRESS",
        pattern: Lazy::new(|| {
            Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b")
                .unwrap()
        }),
        description: "IPv4 address",
    },
    DetectionPattern {
        entity_type: "PHONE",
        pattern: Lazy::new(|| {
            Regex::new(r"(?:\+\d{1,3}[-.\s]?)?\(?\b\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap()
        }),
        description: "Phone number",
    },
    DetectionPattern {
        entity_type: "CUSTOMER_ID",
        pattern: Lazy::new(|| Regex::new(r"(?i)\b(?:cust|customer|user|account)_\d+\b").unwrap()),
        description: "Customer identifier",
    },
];

/// A raw pattern match, in byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub entity_type: &'static str,
    pub start: usize,
    pub end: usize,
    pub description: &'static str,
}

/// Find all non-overlapping pattern matches in a value.
///
/// Overlapping matches from different patterns are resolved in favour of
/// the longer match, then the earlier pattern.
pub fn find_all(value: &str) -> Vec<PatternMatch> {
    let mut found: Vec<(usize, PatternMatch)> = Vec::new();
    for (rank, p) in PATTERNS.iter().enumerate() {
        for m in p.pattern.find_iter(value) {
            found.push((
                rank,
                PatternMatch {
                    entity_type: p.entity_type,
                    start: m.start(),
                    end: m.end(),
                    description: p.description,
                },
            ));
        }
    }

    found.sort_by(|(ra, a), (rb, b)| {
        a.start
            .cmp(&b.start)
            .then((b.end - b.start).cmp(&(a.end - a.start)))
            .then(ra.cmp(rb))
    });

    let mut accepted: Vec<PatternMatch> = Vec::new();
    for (_, m) in found {
        if let Some(last) = accepted.last() {
            if m.start < last.end {
                continue;
            }
        }
        accepted.push(m);
    }
    accepted
}

/// Regex scanner over the built-in patterns.
#[derive(Debug, Clone)]
pub struct PatternScanner {
    source: Source,
}

impl PatternScanner {
    /// Scanner that reports its spans as the deterministic source.
    pub fn new() -> Self {
        Self {
            source: Source::Deterministic,
        }
    }

    /// Scan a text, returning character-offset spans.
    pub fn scan_text(&self, text: &str) -> Vec<Span> {
        let index = CharIndex::new(text);
        find_all(text)
            .into_iter()
            .filter_map(|m| {
                let start = index.char_offset(m.start)?;
                let end = index.char_offset(m.end)?;
                Some(
                    Span::new(start, end, EntityType::new(m.entity_type), self.source)
                        .with_reasoning(m.description),
                )
            })
            .collect()
    }

    /// Entity types this scanner can report.
    pub fn entity_types() -> impl Iterator<Item = EntityType> {
        PATTERNS.iter().map(|p| EntityType::new(p.entity_type))
    }
}

impl Default for PatternScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ResidualScanner for PatternScanner {
    fn name(&self) -> &str {
        "builtin-patterns"
    }

    fn scan(&self, text: &str) -> Vec<Span> {
        self.scan_text(text)
    }
}
