//! Property-based tests for the arbitration and redaction pipeline.

use pm_redact::{
    Action, IncidentInput, KeyMaterial, PolicyStore, PseudonymRegistry, RedactionEngine, Source, Span,
};
use proptest::prelude::*;
use std::sync::Arc;

const ENTITY_TYPES: &[&str] = &["PERSON", "EMAIL", "HOSTNAME", "LOCATION", "ORG", "WEATHER"];

fn engine() -> RedactionEngine {
    RedactionEngine::new(Arc::new(PolicyStore::builtin().unwrap()))
}

fn registry() -> PseudonymRegistry {
    PseudonymRegistry::new(KeyMaterial::from_bytes([42u8; 32], "prop"))
}

fn arb_span() -> impl Strategy<Value = Span> {
    (0usize..90, 0usize..24, 0usize..ENTITY_TYPES.len(), 0usize..3, 0.0f64..1.0).prop_map(
        |(start, len, et, src, conf)| {
            Span::new(start, start + len, ENTITY_TYPES[et], Source::ALL[src]).with_confidence(conf)
        },
    )
}

// Letters, spaces and a few multibyte characters; no digits or '@', so the
// residual scanner has nothing to find in the raw text.
fn arb_text() -> impl Strategy<Value = String> {
    "[a-zA-Z éøßЖ]{0,80}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Decisions are pairwise non-overlapping and lie within the text.
    #[test]
    fn decisions_never_overlap(text in arb_text(), spans in prop::collection::vec(arb_span(), 0..16)) {
        let char_len = text.chars().count();
        let report = engine()
            .process(&IncidentInput::new("p", text.clone()).with_spans(spans), &registry())
            .unwrap();
        let mut prev_end = 0;
        for d in &report.decisions {
            prop_assert!(d.span.start < d.span.end, "empty decision {:?}", d.span);
            prop_assert!(d.span.end <= char_len, "decision {:?} past end {}", d.span, char_len);
            prop_assert!(d.span.start >= prev_end, "decision {:?} overlaps previous end {}", d.span, prev_end);
            prev_end = d.span.end;
        }
    }

    /// Same text, spans, policy and key give the same output and tokens.
    #[test]
    fn processing_is_deterministic(text in arb_text(), spans in prop::collection::vec(arb_span(), 0..16)) {
        let input = IncidentInput::new("p", text).with_spans(spans);
        let a = engine().process(&input, &registry()).unwrap();
        let b = engine().process(&input, &registry()).unwrap();
        prop_assert_eq!(&a.processed_text, &b.processed_text);
        prop_assert_eq!(a.pseudonym_mapping, b.pseudonym_mapping);
        prop_assert_eq!(a.decisions, b.decisions);
    }

    /// Running again on processed output with no new detections is a no-op.
    #[test]
    fn rerun_is_idempotent(text in arb_text(), spans in prop::collection::vec(arb_span(), 0..16)) {
        let eng = engine();
        let reg = registry();
        let first = eng.process(&IncidentInput::new("p", text).with_spans(spans), &reg).unwrap();
        let second = eng
            .process(&IncidentInput::new("p", first.processed_text.clone()), &reg)
            .unwrap();
        prop_assert_eq!(second.processed_text, first.processed_text);
    }

    /// Text outside modifying decisions is preserved.
    #[test]
    fn untouched_text_is_preserved(text in arb_text(), spans in prop::collection::vec(arb_span(), 0..16)) {
        let report = engine()
            .process(&IncidentInput::new("p", text.clone()).with_spans(spans), &registry())
            .unwrap();
        let chars: Vec<char> = text.chars().collect();
        let mut expected = String::new();
        let mut cursor = 0;
        for d in report.decisions.iter().filter(|d| d.action.is_modifying()) {
            expected.extend(&chars[cursor..d.span.start]);
            expected.push('\u{0}');
            cursor = d.span.end;
        }
        expected.extend(&chars[cursor..]);
        // Collapse every marker and token back to a single placeholder.
        let mut actual = report.processed_text.clone();
        for d in report.decisions.iter().filter(|d| d.action == Action::Redact) {
            actual = actual.replacen(&d.entity_type.redaction_marker(), "\u{0}", 1);
        }
        for m in &report.pseudonym_mapping {
            actual = actual.replace(&m.token, "\u{0}");
        }
        prop_assert_eq!(actual, expected);
    }
}
