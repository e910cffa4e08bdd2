//! Fuzz target for the per-incident pipeline.
//!
//! Arbitrary text and arbitrary (often out-of-range or overlapping) spans
//! must never panic, and decisions must stay disjoint and in bounds.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pm_redact::{IncidentInput, KeyMaterial, PolicyStore, PseudonymRegistry, RedactionEngine, Source, Span};
use std::sync::Arc;

const ENTITY_TYPES: &[&str] = &["PERSON", "EMAIL", "HOST", "LOCATION", "ORG", "SSN", "UNKNOWN"];

#[derive(Arbitrary, Debug)]
struct FuzzSpan {
    start: u16,
    len: u8,
    entity: u8,
    source: u8,
    confidence: f64,
}

#[derive(Arbitrary, Debug)]
struct FuzzIncident {
    text: String,
    spans: Vec<FuzzSpan>,
}

fuzz_target!(|incident: FuzzIncident| {
    let Ok(policy) = PolicyStore::builtin() else {
        return;
    };
    let engine = RedactionEngine::new(Arc::new(policy));
    let registry = PseudonymRegistry::new(KeyMaterial::from_bytes([1u8; 32], "fuzz"));

    let spans = incident
        .spans
        .iter()
        .map(|s| {
            let start = s.start as usize;
            let entity = ENTITY_TYPES[s.entity as usize % ENTITY_TYPES.len()];
            let source = Source::ALL[s.source as usize % Source::ALL.len()];
            Span::new(start, start + s.len as usize, entity, source).with_confidence(s.confidence)
        })
        .collect();

    let input = IncidentInput::new("fuzz", incident.text.clone()).with_spans(spans);
    let Ok(report) = engine.process(&input, &registry) else {
        return;
    };

    let char_len = incident.text.chars().count();
    let mut prev_end = 0;
    for d in &report.decisions {
        assert!(d.span.start < d.span.end && d.span.end <= char_len);
        assert!(d.span.start >= prev_end);
        prev_end = d.span.end;
    }
});
