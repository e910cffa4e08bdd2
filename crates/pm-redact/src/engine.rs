//! Per-incident redaction pipeline.
//!
//! The [`RedactionEngine`] chains collection, arbitration, application and
//! validation for one incident. It holds only read-only state; the
//! run-scoped [`PseudonymRegistry`] is passed in by the caller so that many
//! incidents can share it.

use crate::apply::RedactionApplier;
use crate::arbitrate::{ArbitrationEngine, ArbitrationStats, Decision};
use crate::cluster::{CollectorStats, SpanCollector};
use crate::detect::PatternScanner;
use crate::error::Result;
use crate::policy::PolicyStore;
use crate::pseudonym::{looks_like_marker, looks_like_token, MappingRecord, PseudonymRegistry};
use crate::span::{CharIndex, Source, Span};
use crate::validate::{GroundTruthSpan, QualityReport, QualityValidator, ResidualScanner, ValidationContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info_span};

/// One incident to process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentInput {
    pub id: String,
    pub text: String,
    /// Spans from every source that answered.
    #[serde(default)]
    pub spans: Vec<Span>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<Vec<GroundTruthSpan>>,
    /// Sources that timed out or failed for this incident.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_sources: Vec<Source>,
}

impl IncidentInput {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_spans(mut self, spans: Vec<Span>) -> Self {
        self.spans = spans;
        self
    }
}

/// Counters for one incident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentStats {
    pub spans_received: usize,
    pub invalid_spans: usize,
    pub duplicate_spans: usize,
    /// Spans covering an existing marker or token, ignored.
    pub artifact_spans: usize,
    pub arbitration: ArbitrationStats,
    pub replacements: usize,
}

/// Output report for one incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentReport {
    pub incident_id: String,
    pub processed_text: String,
    pub decisions: Vec<Decision>,
    pub pseudonym_mapping: Vec<MappingRecord>,
    pub quality_metrics: QualityReport,
    pub recommendations: Vec<String>,
    pub stats: IncidentStats,
}

/// Engine options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Include canonical original values in pseudonym mappings.
    pub include_original_values: bool,
}

/// The per-incident redaction engine.
#[derive(Clone)]
pub struct RedactionEngine {
    policy: Arc<PolicyStore>,
    scanner: Arc<dyn ResidualScanner>,
    options: EngineOptions,
}

impl RedactionEngine {
    /// Engine with the built-in residual scanner.
    pub fn new(policy: Arc<PolicyStore>) -> Self {
        Self {
            policy,
            scanner: Arc::new(PatternScanner::new()),
            options: EngineOptions::default(),
        }
    }

    /// Replace the residual scanner.
    pub fn with_scanner(mut self, scanner: Arc<dyn ResidualScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    /// Process one incident.
    pub fn process(&self, input: &IncidentInput, registry: &PseudonymRegistry) -> Result<IncidentReport> {
        let span = info_span!("incident", id = %input.id);
        let _enter = span.enter();

        let text = input.text.as_str();
        let index = CharIndex::new(text);

        let mut collector = SpanCollector::new(index.char_len());
        let mut artifact_spans = 0;
        for s in &input.spans {
            if self.is_artifact(text, &index, s, registry)? {
                artifact_spans += 1;
                continue;
            }
            collector.add(s.clone());
        }
        let (clusters, collected) = collector.into_clusters();

        let arbitration = ArbitrationEngine::new(&self.policy).arbitrate(text, &index, &clusters);
        let applied = RedactionApplier::new(registry).apply(text, &index, &arbitration.decisions)?;

        let validation = QualityValidator::new(&self.policy, self.scanner.as_ref()).validate(&ValidationContext {
            original_text: text,
            decisions: &arbitration.decisions,
            applied: &applied,
            stats: &arbitration.stats,
            ground_truth: input.ground_truth.as_deref(),
            degraded_sources: &input.degraded_sources,
        });

        let tokens: Vec<String> = applied
            .replacements
            .iter()
            .filter(|r| r.action == crate::Action::Pseudonymize)
            .map(|r| r.replacement.clone())
            .collect();
        let pseudonym_mapping = registry.mapping(Some(&tokens), self.options.include_original_values)?;

        let stats = incident_stats(collected, artifact_spans, arbitration.stats, applied.replacements.len());
        debug!(
            decisions = arbitration.decisions.len(),
            replacements = stats.replacements,
            residual = validation.report.residual_count,
            "incident processed"
        );

        Ok(IncidentReport {
            incident_id: input.id.clone(),
            processed_text: applied.processed_text,
            decisions: arbitration.decisions,
            pseudonym_mapping,
            quality_metrics: validation.report,
            recommendations: validation.recommendations,
            stats,
        })
    }

    /// Whether a span covers output of an earlier pass.
    fn is_artifact(&self, text: &str, index: &CharIndex, span: &Span, registry: &PseudonymRegistry) -> Result<bool> {
        let Some(covered) = index.slice(text, span.start, span.end) else {
            return Ok(false);
        };
        let covered = covered.trim();
        Ok(looks_like_marker(covered) || looks_like_token(covered) || registry.is_issued_token(covered)?)
    }
}

fn incident_stats(
    collected: CollectorStats,
    artifact_spans: usize,
    arbitration: ArbitrationStats,
    replacements: usize,
) -> IncidentStats {
    IncidentStats {
        spans_received: collected.received + artifact_spans,
        invalid_spans: collected.invalid_spans,
        duplicate_spans: collected.duplicate_spans,
        artifact_spans,
        arbitration,
        replacements,
    }
}
