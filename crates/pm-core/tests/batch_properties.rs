//! Property-based tests for batch processing invariants.

use pm_core::batch::{BatchInput, BatchRunner, DetectionRecord, Detections, IncidentRecord};
use pm_core::config::ScrubConfig;
use pm_redact::{KeyMaterial, PolicyStore, PseudonymRegistry};
use proptest::prelude::*;
use std::sync::Arc;

const NAMES: &[&str] = &["Grace Hopper", "Alan Turing", "Edsger Dijkstra", "Barbara Liskov"];

fn person(text: &str, name: &str) -> Vec<DetectionRecord> {
    let chars: Vec<char> = text.chars().collect();
    let needle: Vec<char> = name.chars().collect();
    (0..=chars.len() - needle.len())
        .filter(|&i| chars[i..i + needle.len()] == needle[..])
        .map(|i| DetectionRecord {
            start: i,
            end: i + needle.len(),
            entity_type: "PERSON".to_string(),
            confidence: Some(0.9),
            reasoning: None,
        })
        .collect()
}

fn batch(pairs: &[(usize, usize)]) -> BatchInput {
    BatchInput {
        incidents: pairs
            .iter()
            .enumerate()
            .map(|(i, &(a, b))| {
                let (first, second) = (NAMES[a], NAMES[b]);
                let text = format!("{} paged {} about shard {}", first, second, i);
                let mut deterministic = person(&text, first);
                if a != b {
                    deterministic.extend(person(&text, second));
                }
                IncidentRecord {
                    id: format!("INC-{}", i),
                    text,
                    detections: Detections {
                        deterministic,
                        ..Default::default()
                    },
                    ground_truth: None,
                }
            })
            .collect(),
    }
}

fn processed(input: &BatchInput, parallel: usize) -> Vec<(String, String)> {
    let mut config = ScrubConfig::default();
    config.batch.max_parallel_incidents = parallel;
    let runner = BatchRunner::new(Arc::new(PolicyStore::builtin().unwrap()), config);
    let registry = PseudonymRegistry::new(KeyMaterial::from_salt("props", "it").unwrap());
    let report = runner.run(input, &registry, "run-props").unwrap();
    report
        .incidents
        .iter()
        .map(|e| {
            let text = e.report.as_ref().map(|r| r.processed_text.clone()).unwrap_or_default();
            (e.incident_id().to_string(), text)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn output_is_independent_of_parallelism(
        pairs in prop::collection::vec((0..NAMES.len(), 0..NAMES.len()), 1..10),
        parallel in 2usize..6,
    ) {
        let input = batch(&pairs);
        let serial = processed(&input, 1);
        let concurrent = processed(&input, parallel);
        prop_assert_eq!(&serial, &concurrent);

        for (i, (id, text)) in serial.iter().enumerate() {
            prop_assert_eq!(id, &format!("INC-{}", i));
            for name in NAMES {
                prop_assert!(!text.contains(name), "{} leaked in {}", name, text);
            }
        }
    }

    #[test]
    fn same_name_maps_to_same_token_across_incidents(
        pairs in prop::collection::vec((0..NAMES.len(), 0..NAMES.len()), 2..8),
    ) {
        let input = batch(&pairs);
        let out = processed(&input, 3);
        // Each output begins with the pseudonym of its first name.
        let mut tokens: std::collections::HashMap<usize, String> = std::collections::HashMap::new();
        for ((a, _), (_, text)) in pairs.iter().zip(&out) {
            let token = text.split(" paged ").next().unwrap_or_default().to_string();
            let seen = tokens.entry(*a).or_insert_with(|| token.clone());
            prop_assert_eq!(seen, &token);
        }
    }
}
