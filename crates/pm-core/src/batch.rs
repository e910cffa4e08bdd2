//! Batch processing: many incidents, one run-scoped pseudonym registry.
//!
//! Incidents are independent except for the shared [`PseudonymRegistry`],
//! so they are processed in parallel chunks of `max_parallel_incidents`.
//! A failed incident (e.g. a mandatory detector timed out) is recorded in
//! the report and the batch carries on.

use crate::config::{ConfigSnapshot, ScrubConfig};
use crate::detectors::{PatternDetector, PrecomputedDetector};
use crate::dispatch::{DetectorReport, DetectorSource, Dispatcher, IncidentDocument};
use crate::exit_codes::ExitCode;
use chrono::{DateTime, Utc};
use pm_redact::{
    EngineOptions, GroundTruthSpan, IncidentInput, IncidentReport, IssueKind, MappingRecord, PolicyStore,
    PseudonymRegistry, RedactionEngine, RedactionError, Severity, Source, Span,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, info_span, warn};

/// Schema version of the batch report.
pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";

/// Errors reading or validating batch input.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid batch input: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid batch input: {0}")]
    Invalid(String),
}

/// One detection as supplied in the batch input. The source is implied by
/// the list it appears in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub start: usize,
    pub end: usize,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl DetectionRecord {
    fn to_span(&self, source: Source) -> Span {
        let mut span = Span::new(self.start, self.end, self.entity_type.as_str(), source);
        if let Some(c) = self.confidence {
            span = span.with_confidence(c);
        }
        if let Some(r) = &self.reasoning {
            span = span.with_reasoning(r.clone());
        }
        span
    }
}

/// Precomputed detections, grouped by source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Detections {
    pub deterministic: Vec<DetectionRecord>,
    pub finder: Vec<DetectionRecord>,
    pub judge: Vec<DetectionRecord>,
}

impl Detections {
    pub fn for_source(&self, source: Source) -> &[DetectionRecord] {
        match source {
            Source::Deterministic => &self.deterministic,
            Source::Finder => &self.finder,
            Source::Judge => &self.judge,
        }
    }

    pub fn spans(&self, source: Source) -> Vec<Span> {
        self.for_source(source).iter().map(|d| d.to_span(source)).collect()
    }
}

/// One incident in the batch input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub detections: Detections,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<Vec<GroundTruthSpan>>,
}

/// The batch input document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchInput {
    pub incidents: Vec<IncidentRecord>,
}

impl BatchInput {
    /// Parse and validate a batch input document.
    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        let input: BatchInput = serde_json::from_str(json)?;
        input.validate()?;
        Ok(input)
    }

    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let content = std::fs::read_to_string(path).map_err(|e| BatchError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&content)
    }

    /// Incident ids must be present and unique.
    pub fn validate(&self) -> Result<(), BatchError> {
        let mut seen = HashSet::new();
        for (i, incident) in self.incidents.iter().enumerate() {
            if incident.id.trim().is_empty() {
                return Err(BatchError::Invalid(format!("incident #{} has an empty id", i)));
            }
            if !seen.insert(incident.id.as_str()) {
                return Err(BatchError::Invalid(format!("duplicate incident id '{}'", incident.id)));
            }
        }
        Ok(())
    }
}

/// Whether an incident made it through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Processed,
    Failed,
}

/// Why an incident was not processed. Never quotes incident text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentFailure {
    pub incident_id: String,
    pub error: String,
}

/// One line of `incidents[]` in the batch report.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentEntry {
    pub status: IncidentStatus,
    #[serde(flatten)]
    pub report: Option<IncidentReport>,
    #[serde(flatten)]
    pub failure: Option<IncidentFailure>,
    pub detectors: Vec<DetectorReport>,
}

impl IncidentEntry {
    pub fn incident_id(&self) -> &str {
        match (&self.report, &self.failure) {
            (Some(r), _) => &r.incident_id,
            (None, Some(f)) => &f.incident_id,
            (None, None) => "",
        }
    }

    fn processed(report: IncidentReport, detectors: Vec<DetectorReport>) -> Self {
        Self {
            status: IncidentStatus::Processed,
            report: Some(report),
            failure: None,
            detectors,
        }
    }

    fn failed(incident_id: &str, err: &RedactionError, detectors: Vec<DetectorReport>) -> Self {
        Self {
            status: IncidentStatus::Failed,
            report: None,
            failure: Some(IncidentFailure {
                incident_id: incident_id.to_string(),
                error: err.to_string(),
            }),
            detectors,
        }
    }
}

/// Run-wide totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub incidents: usize,
    pub processed: usize,
    pub failed: usize,
    pub decisions: usize,
    pub redacted: usize,
    pub pseudonymized: usize,
    pub retained: usize,
    pub ambiguous: usize,
    pub residual_pii: usize,
    pub validation_issues: usize,
    pub critical_issues: usize,
    pub degraded_incidents: usize,
    pub distinct_pseudonyms: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_overall_score: Option<f64>,
    pub elapsed_ms: u64,
}

/// The batch report.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub policy_hash: String,
    pub key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigSnapshot>,
    pub incidents: Vec<IncidentEntry>,
    /// Every token issued during the run.
    pub pseudonym_mapping: Vec<MappingRecord>,
    pub summary: BatchSummary,
}

impl BatchReport {
    /// Exit code grading this run.
    ///
    /// Failed incidents outrank critical findings, which outrank any other
    /// validation issue.
    pub fn exit_code(&self) -> ExitCode {
        let s = &self.summary;
        if s.failed > 0 {
            ExitCode::PartialFail
        } else if s.residual_pii > 0 || s.critical_issues > 0 {
            ExitCode::CriticalIssues
        } else if s.validation_issues > 0 {
            ExitCode::IssuesFound
        } else {
            ExitCode::Clean
        }
    }
}

/// Runs a batch against one policy and one registry.
pub struct BatchRunner {
    engine: RedactionEngine,
    config: ScrubConfig,
    extra_detectors: Vec<Arc<dyn DetectorSource>>,
}

impl BatchRunner {
    pub fn new(policy: Arc<PolicyStore>, config: ScrubConfig) -> Self {
        let engine = RedactionEngine::new(policy).with_options(EngineOptions {
            include_original_values: config.report.include_original_values,
        });
        Self {
            engine,
            config,
            extra_detectors: Vec::new(),
        }
    }

    /// Add a detector consulted for every incident, after the
    /// precomputed ones.
    pub fn with_detector(mut self, detector: Arc<dyn DetectorSource>) -> Self {
        self.extra_detectors.push(detector);
        self
    }

    pub fn config(&self) -> &ScrubConfig {
        &self.config
    }

    /// Process every incident and assemble the report.
    pub fn run(&self, input: &BatchInput, registry: &PseudonymRegistry, run_id: &str) -> pm_redact::Result<BatchReport> {
        let span = info_span!("batch", run_id = %run_id);
        let _enter = span.enter();
        let started = Instant::now();
        let max_parallel = self.config.batch.max_parallel_incidents.max(1);
        info!(
            incidents = input.incidents.len(),
            max_parallel,
            policy_hash = %self.engine.policy().content_hash(),
            "batch started"
        );

        let incidents: Vec<IncidentEntry> = input
            .incidents
            .chunks(max_parallel)
            .flat_map(|chunk| {
                thread::scope(|s| {
                    let handles: Vec<_> = chunk
                        .iter()
                        .map(|record| (record, s.spawn(move || self.process_incident(record, registry))))
                        .collect();

                    handles
                        .into_iter()
                        .map(|(record, h)| {
                            h.join().unwrap_or_else(|_| {
                                error!(incident = %record.id, "incident thread panicked");
                                IncidentEntry::failed(&record.id, &RedactionError::internal(), Vec::new())
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let include_original = self.config.report.include_original_values;
        let pseudonym_mapping = registry.mapping(None, include_original)?;
        let summary = summarize(&incidents, pseudonym_mapping.len(), started);
        info!(
            processed = summary.processed,
            failed = summary.failed,
            residual_pii = summary.residual_pii,
            elapsed_ms = summary.elapsed_ms,
            "batch finished"
        );

        Ok(BatchReport {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            run_id: run_id.to_string(),
            generated_at: Utc::now(),
            policy_hash: self.engine.policy().content_hash().to_string(),
            key_id: registry.key_id().to_string(),
            config: None,
            incidents,
            pseudonym_mapping,
            summary,
        })
    }

    /// Dispatch detectors for one incident, then run the redaction pipeline.
    pub fn process_incident(&self, record: &IncidentRecord, registry: &PseudonymRegistry) -> IncidentEntry {
        let doc = Arc::new(IncidentDocument::new(record.id.clone(), record.text.clone()));
        let detectors = self.detectors_for(record);

        let dispatcher = Dispatcher::new(self.engine.policy(), self.config.detectors.clone());
        let outcome = match dispatcher.dispatch(&doc, &detectors) {
            Ok(outcome) => outcome,
            Err(failure) => {
                warn!(incident = %record.id, error = %failure.error, "incident aborted");
                return IncidentEntry::failed(&record.id, &failure.error, failure.detectors);
            }
        };

        let input = IncidentInput {
            id: record.id.clone(),
            text: record.text.clone(),
            spans: outcome.spans,
            ground_truth: record.ground_truth.clone(),
            degraded_sources: outcome.degraded_sources,
        };
        match self.engine.process(&input, registry) {
            Ok(report) => {
                if report.quality_metrics.has_kind(IssueKind::ResidualPii) {
                    warn!(
                        incident = %record.id,
                        residual = report.quality_metrics.residual_count,
                        "residual PII detected in processed output"
                    );
                }
                info!(
                    incident = %record.id,
                    decisions = report.decisions.len(),
                    replacements = report.stats.replacements,
                    score = report.quality_metrics.overall_score,
                    "incident processed"
                );
                IncidentEntry::processed(report, outcome.detectors)
            }
            Err(e) => {
                error!(incident = %record.id, error = %e, "incident failed");
                IncidentEntry::failed(&record.id, &e, outcome.detectors)
            }
        }
    }

    fn detectors_for(&self, record: &IncidentRecord) -> Vec<Arc<dyn DetectorSource>> {
        let mut detectors: Vec<Arc<dyn DetectorSource>> = Source::ALL
            .iter()
            .map(|&source| {
                Arc::new(PrecomputedDetector::new(source, record.detections.spans(source))) as Arc<dyn DetectorSource>
            })
            .collect();
        if self.config.detectors.enable_builtin_patterns {
            detectors.push(Arc::new(PatternDetector::new()));
        }
        detectors.extend(self.extra_detectors.iter().cloned());
        detectors
    }
}

fn summarize(incidents: &[IncidentEntry], distinct_pseudonyms: usize, started: Instant) -> BatchSummary {
    let mut summary = BatchSummary {
        incidents: incidents.len(),
        distinct_pseudonyms,
        ..Default::default()
    };
    let mut score_total = 0.0;

    for entry in incidents {
        let Some(report) = &entry.report else {
            summary.failed += 1;
            continue;
        };
        summary.processed += 1;
        let stats = &report.stats.arbitration;
        summary.decisions += report.decisions.len();
        summary.redacted += stats.redacted;
        summary.pseudonymized += stats.pseudonymized;
        summary.retained += stats.retained;
        summary.ambiguous += stats.ambiguous;

        let quality = &report.quality_metrics;
        summary.residual_pii += quality.residual_count;
        summary.validation_issues += quality.validation_issues.len();
        summary.critical_issues += quality
            .validation_issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
            .count();
        if quality.has_kind(IssueKind::DetectorDegraded) {
            summary.degraded_incidents += 1;
        }
        summary.worst_severity = match (summary.worst_severity, quality.worst_severity()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        score_total += quality.overall_score;
    }

    if summary.processed > 0 {
        summary.mean_overall_score = Some(score_total / summary.processed as f64);
    }
    summary.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_redact::KeyMaterial;

    fn registry() -> PseudonymRegistry {
        PseudonymRegistry::new(KeyMaterial::from_bytes([7u8; 32], "batch-test"))
    }

    fn runner() -> BatchRunner {
        BatchRunner::new(Arc::new(PolicyStore::builtin().unwrap()), ScrubConfig::default())
    }

    const INPUT: &str = r#"{
        "incidents": [
            {
                "id": "INC-1",
                "text": "Paged John Smith about db-7",
                "detections": {
                    "finder": [{"start": 6, "end": 16, "entity_type": "PERSON", "confidence": 0.9}]
                }
            },
            {
                "id": "INC-2",
                "text": "john smith acked",
                "detections": {
                    "judge": [{"start": 0, "end": 10, "entity_type": "PERSON"}]
                }
            }
        ]
    }"#;

    #[test]
    fn test_parse_and_validate() {
        let input = BatchInput::from_json(INPUT).unwrap();
        assert_eq!(input.incidents.len(), 2);
        let spans = input.incidents[0].detections.spans(Source::Finder);
        assert_eq!(spans[0].source, Source::Finder);
        assert!((spans[0].confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let json = r#"{"incidents": [{"id": "A", "text": "x"}, {"id": "A", "text": "y"}]}"#;
        assert!(matches!(BatchInput::from_json(json), Err(BatchError::Invalid(_))));
    }

    #[test]
    fn test_empty_id_rejected() {
        let json = r#"{"incidents": [{"id": " ", "text": "x"}]}"#;
        assert!(matches!(BatchInput::from_json(json), Err(BatchError::Invalid(_))));
    }

    #[test]
    fn test_batch_shares_pseudonyms() {
        let input = BatchInput::from_json(INPUT).unwrap();
        let report = runner().run(&input, &registry(), "run-test").unwrap();

        assert_eq!(report.summary.processed, 2);
        assert_eq!(report.summary.distinct_pseudonyms, 1);
        let token = &report.pseudonym_mapping[0].token;
        let first = report.incidents[0].report.as_ref().unwrap();
        let second = report.incidents[1].report.as_ref().unwrap();
        assert_eq!(first.processed_text, format!("Paged {} about db-7", token));
        assert_eq!(second.processed_text, format!("{} acked", token));
        assert_eq!(report.exit_code(), ExitCode::Clean);
    }

    #[test]
    fn test_incident_order_preserved_across_chunks() {
        let incidents = (0..9)
            .map(|i| IncidentRecord {
                id: format!("INC-{}", i),
                text: format!("note {}", i),
                detections: Detections::default(),
                ground_truth: None,
            })
            .collect();
        let mut config = ScrubConfig::default();
        config.batch.max_parallel_incidents = 2;
        let runner = BatchRunner::new(Arc::new(PolicyStore::builtin().unwrap()), config);
        let report = runner.run(&BatchInput { incidents }, &registry(), "run-order").unwrap();
        let ids: Vec<_> = report.incidents.iter().map(|e| e.incident_id().to_string()).collect();
        let expected: Vec<_> = (0..9).map(|i| format!("INC-{}", i)).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_builtin_patterns_catch_undetected_email() {
        let input = BatchInput::from_json(r#"{"incidents": [{"id": "A", "text": "ping ops@corp.io"}]}"#).unwrap();
        let mut config = ScrubConfig::default();
        config.detectors.enable_builtin_patterns = true;
        let runner = BatchRunner::new(Arc::new(PolicyStore::builtin().unwrap()), config);
        let report = runner.run(&input, &registry(), "run-pat").unwrap();
        let entry = report.incidents[0].report.as_ref().unwrap();
        assert_eq!(entry.processed_text, "ping [REDACTED_EMAIL]");
        assert_eq!(report.incidents[0].detectors.len(), 4);
    }

    #[test]
    fn test_residual_grades_critical() {
        // Nothing was detected, so the scanner finds the SSN in the output.
        let input = BatchInput::from_json(r#"{"incidents": [{"id": "A", "text": "ssn 123-45-6789"}]}"#).unwrap();
        let report = runner().run(&input, &registry(), "run-res").unwrap();
        assert_eq!(report.summary.residual_pii, 1);
        assert_eq!(report.exit_code(), ExitCode::CriticalIssues);
    }

    #[test]
    fn test_failed_entry_serializes_error() {
        let entry = IncidentEntry::failed(
            "INC-9",
            &RedactionError::MandatoryDetectorFailure {
                detector: Source::Judge,
                reason: "timeout".to_string(),
            },
            Vec::new(),
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["incident_id"], "INC-9");
        assert!(json["error"].as_str().unwrap().contains("judge"));
        assert!(json.get("processed_text").is_none());
    }
}
