//! Post-redaction quality validation.
//!
//! The validator re-scans the processed text for residual PII, checks that
//! structured input kept its shape, cross-checks decisions and pseudonyms
//! for consistency, and turns all of it into an ordered issue list,
//! precision/recall/F1 metrics and recommendations.

use crate::apply::{ApplyOutcome, Replacement};
use crate::arbitrate::{ArbitrationStats, Decision, TextRange};
use crate::policy::{PolicyStore, SensitivityLevel};
use crate::span::{CharIndex, EntityType, Source, Span};
use crate::structured::{same_shape, unescape_fragment};
use crate::Action;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Minimum overall score before a recommendation is emitted.
pub const OVERALL_SCORE_THRESHOLD: f64 = 0.8;
/// Minimum precision before a recommendation is emitted.
pub const PRECISION_THRESHOLD: f64 = 0.9;
/// Minimum recall before a recommendation is emitted.
pub const RECALL_THRESHOLD: f64 = 0.95;

/// Re-detection over processed output.
pub trait ResidualScanner: Send + Sync {
    /// Scanner name for logs and issue descriptions.
    fn name(&self) -> &str;

    /// Spans found in `text` (character offsets).
    fn scan(&self, text: &str) -> Vec<Span>;
}

/// Issue severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Penalty subtracted from the overall score per issue.
    pub fn penalty(&self) -> f64 {
        match self {
            Severity::Critical => 0.3,
            Severity::High => 0.2,
            Severity::Medium => 0.1,
            Severity::Low => 0.05,
        }
    }

    /// Severity for a finding in a category of the given sensitivity.
    pub fn from_sensitivity(level: SensitivityLevel) -> Self {
        match level {
            SensitivityLevel::Critical => Severity::Critical,
            SensitivityLevel::High => Severity::High,
            SensitivityLevel::Medium => Severity::Medium,
            SensitivityLevel::Low | SensitivityLevel::Minimum => Severity::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        };
        f.write_str(s)
    }
}

/// Kind of validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ResidualPii,
    AmbiguousPolicy,
    SchemaViolation,
    StructureProtected,
    Inconsistency,
    DetectorDegraded,
}

/// One finding of the validator. Descriptions never quote input text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    /// Character range in the processed text, where applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

impl ValidationIssue {
    fn new(severity: Severity, kind: IssueKind, description: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            description: description.into(),
            entity_type: None,
            start: None,
            end: None,
        }
    }

    fn at(mut self, entity_type: &EntityType, start: usize, end: usize) -> Self {
        self.entity_type = Some(entity_type.clone());
        self.start = Some(start);
        self.end = Some(end);
        self
    }
}

/// How precision and recall were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsBasis {
    GroundTruth,
    ApproximatedFromDeterministicCounts,
}

/// Known PII location in the original text, for scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruthSpan {
    pub start: usize,
    pub end: usize,
    pub entity_type: EntityType,
}

/// Validator output for one incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub overall_score: f64,
    pub residual_count: usize,
    pub schema_ok: bool,
    pub metrics_basis: MetricsBasis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_note: Option<String>,
    pub validation_issues: Vec<ValidationIssue>,
}

impl QualityReport {
    /// Most severe issue, if any.
    pub fn worst_severity(&self) -> Option<Severity> {
        self.validation_issues.iter().map(|i| i.severity).min()
    }

    pub fn has_kind(&self, kind: IssueKind) -> bool {
        self.validation_issues.iter().any(|i| i.kind == kind)
    }
}

/// Everything the validator looks at for one incident.
pub struct ValidationContext<'a> {
    pub original_text: &'a str,
    pub decisions: &'a [Decision],
    pub applied: &'a ApplyOutcome,
    pub stats: &'a ArbitrationStats,
    pub ground_truth: Option<&'a [GroundTruthSpan]>,
    /// Sources that timed out or failed for this incident.
    pub degraded_sources: &'a [Source],
}

/// Validator output: the report plus ordered recommendations.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub report: QualityReport,
    pub recommendations: Vec<String>,
}

/// Quality validator bound to a policy and a residual scanner.
pub struct QualityValidator<'a> {
    policy: &'a PolicyStore,
    scanner: &'a dyn ResidualScanner,
}

impl<'a> QualityValidator<'a> {
    pub fn new(policy: &'a PolicyStore, scanner: &'a dyn ResidualScanner) -> Self {
        Self { policy, scanner }
    }

    /// Validate one processed incident.
    pub fn validate(&self, ctx: &ValidationContext<'_>) -> ValidationOutcome {
        let mut issues = Vec::new();

        let residual_count = self.check_residuals(ctx, &mut issues);
        let schema_ok = check_schema(ctx, &mut issues);
        check_decisions(ctx, &mut issues);
        self.check_pseudonyms(ctx, &mut issues);

        for d in ctx.decisions.iter().filter(|d| d.is_ambiguous()) {
            let severity = d
                .sensitivity_level
                .map(Severity::from_sensitivity)
                .unwrap_or(Severity::Low);
            issues.push(
                ValidationIssue::new(
                    severity,
                    IssueKind::AmbiguousPolicy,
                    format!(
                        "ambiguous arbitration at chars {}..{}: equal votes for conflicting policies, retained",
                        d.span.start, d.span.end
                    ),
                )
                .at(&d.entity_type, ctx.applied.map_offset(d.span.start), ctx.applied.map_offset(d.span.end)),
            );
        }

        for p in &ctx.applied.protected {
            issues.push(
                ValidationIssue::new(
                    Severity::High,
                    IssueKind::StructureProtected,
                    format!(
                        "{} decision at chars {}..{} touches no JSON string value and was not applied",
                        p.entity_type, p.span.start, p.span.end
                    ),
                )
                .at(&p.entity_type, ctx.applied.map_offset(p.span.start), ctx.applied.map_offset(p.span.end)),
            );
        }

        for source in ctx.degraded_sources {
            issues.push(ValidationIssue::new(
                Severity::Medium,
                IssueKind::DetectorDegraded,
                format!("{} detector did not contribute (timeout or failure)", source),
            ));
        }

        // Stable: equal severities keep discovery order.
        issues.sort_by_key(|i| i.severity);

        let (precision, recall, basis, note) = compute_metrics(ctx, residual_count);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        let penalty: f64 = issues.iter().map(|i| i.severity.penalty()).sum();
        let overall_score = (1.0 - penalty).clamp(0.0, 1.0);

        let report = QualityReport {
            precision,
            recall,
            f1,
            overall_score,
            residual_count,
            schema_ok,
            metrics_basis: basis,
            metrics_note: note,
            validation_issues: issues,
        };
        let recommendations = recommendations(&report);

        debug!(
            residual = residual_count,
            issues = report.validation_issues.len(),
            overall = report.overall_score,
            "validation complete"
        );
        ValidationOutcome {
            report,
            recommendations,
        }
    }

    /// Scan the output and record every residual the policy would not
    /// leave in place. Returns the residual count.
    fn check_residuals(&self, ctx: &ValidationContext<'_>, issues: &mut Vec<ValidationIssue>) -> usize {
        let output = &ctx.applied.processed_text;
        let index = CharIndex::new(output);

        let retained: Vec<(TextRange, &Decision)> = ctx
            .decisions
            .iter()
            .filter(|d| d.action == Action::Retain || d.is_ambiguous())
            .map(|d| {
                let range = TextRange::new(ctx.applied.map_offset(d.span.start), ctx.applied.map_offset(d.span.end));
                (range, d)
            })
            .collect();

        let mut count = 0;
        for mut span in self.scanner.scan(output) {
            let Some((start, end)) = outside_artifacts(output, &index, span.start, span.end, &ctx.applied.replacements)
            else {
                continue;
            };
            span.start = start;
            span.end = end;
            if retained
                .iter()
                .any(|(range, d)| range.contains_range(span.start, span.end) && self.retains(d, &span.entity_type))
            {
                continue;
            }
            let value = index.slice(output, span.start, span.end).unwrap_or("");
            if self.policy.action_for(&span.entity_type, value) == Action::Retain {
                continue;
            }

            let severity = self
                .policy
                .rule_for(&span.entity_type)
                .map(|r| Severity::from_sensitivity(r.sensitivity_level))
                .unwrap_or(Severity::High);
            warn!(
                entity_type = %span.entity_type,
                start = span.start,
                end = span.end,
                scanner = self.scanner.name(),
                "residual PII in processed output"
            );
            issues.push(
                ValidationIssue::new(
                    severity,
                    IssueKind::ResidualPii,
                    format!(
                        "residual {} at chars {}..{} of processed output ({})",
                        span.entity_type,
                        span.start,
                        span.end,
                        self.scanner.name()
                    ),
                )
                .at(&span.entity_type, span.start, span.end),
            );
            count += 1;
        }
        count
    }

    /// Whether a retained decision covers a residual of `entity_type`. Only
    /// types the decision voted on count, never forced ones, and never at a
    /// sensitivity above the decision's own.
    fn retains(&self, decision: &Decision, entity_type: &EntityType) -> bool {
        let voted = decision.entity_type == *entity_type
            || decision.vote_breakdown.iter().any(|t| t.entity_type == *entity_type);
        if !voted {
            return false;
        }
        match self.policy.rule_for(entity_type) {
            Some(rule) if rule.force => false,
            Some(rule) => decision
                .sensitivity_level
                .is_some_and(|level| rule.sensitivity_level <= level),
            None => true,
        }
    }

    /// Each (entity type, canonical value) maps to exactly one token.
    fn check_pseudonyms(&self, ctx: &ValidationContext<'_>, issues: &mut Vec<ValidationIssue>) {
        let index = CharIndex::new(ctx.original_text);
        let canonicalizer = self.policy.canonicalizer();
        let mut seen: HashMap<(EntityType, String), &str> = HashMap::new();
        for r in ctx.applied.replacements.iter().filter(|r| r.action == Action::Pseudonymize) {
            let Some(value) = index.slice(ctx.original_text, r.original.start, r.original.end) else {
                continue;
            };
            let value = if ctx.applied.structured {
                unescape_fragment(value)
            } else {
                value.into()
            };
            let key = (r.entity_type.clone(), canonicalizer.canonicalize(&r.entity_type, &value));
            match seen.get(&key) {
                Some(token) if *token != r.replacement => {
                    issues.push(
                        ValidationIssue::new(
                            Severity::High,
                            IssueKind::Inconsistency,
                            format!("one {} value received two different pseudonyms", r.entity_type),
                        )
                        .at(&r.entity_type, r.output.start, r.output.end),
                    );
                }
                Some(_) => {}
                None => {
                    seen.insert(key, &r.replacement);
                }
            }
        }
    }
}

/// Structured input must keep its JSON shape; plain text its line count.
fn check_schema(ctx: &ValidationContext<'_>, issues: &mut Vec<ValidationIssue>) -> bool {
    let output = &ctx.applied.processed_text;
    if ctx.applied.structured {
        let before = serde_json::from_str::<serde_json::Value>(ctx.original_text);
        let after = serde_json::from_str::<serde_json::Value>(output);
        return match (before, after) {
            (Ok(b), Ok(a)) if same_shape(&b, &a) => true,
            (Ok(_), Ok(_)) => {
                issues.push(ValidationIssue::new(
                    Severity::High,
                    IssueKind::SchemaViolation,
                    "processed JSON no longer has the original structure",
                ));
                false
            }
            _ => {
                issues.push(ValidationIssue::new(
                    Severity::High,
                    IssueKind::SchemaViolation,
                    "processed output is no longer valid JSON",
                ));
                false
            }
        };
    }

    let lines_before = ctx.original_text.lines().count();
    let lines_after = output.lines().count();
    if lines_before != lines_after {
        issues.push(ValidationIssue::new(
            Severity::High,
            IssueKind::SchemaViolation,
            format!("line count changed from {} to {}", lines_before, lines_after),
        ));
        return false;
    }
    true
}

/// Decision spans must be in bounds and pairwise non-overlapping.
fn check_decisions(ctx: &ValidationContext<'_>, issues: &mut Vec<ValidationIssue>) {
    let char_len = ctx.original_text.chars().count();
    let mut prev_end = 0;
    for d in ctx.decisions {
        if d.span.start >= d.span.end || d.span.end > char_len {
            issues.push(ValidationIssue::new(
                Severity::Critical,
                IssueKind::Inconsistency,
                format!("decision {}..{} lies outside the text", d.span.start, d.span.end),
            ));
        }
        if d.span.start < prev_end {
            issues.push(ValidationIssue::new(
                Severity::Critical,
                IssueKind::Inconsistency,
                format!("decision {}..{} overlaps its predecessor", d.span.start, d.span.end),
            ));
        }
        prev_end = prev_end.max(d.span.end);
    }
}

fn compute_metrics(ctx: &ValidationContext<'_>, residual: usize) -> (f64, f64, MetricsBasis, Option<String>) {
    let modifying: Vec<&Decision> = ctx.decisions.iter().filter(|d| d.action.is_modifying()).collect();

    match ctx.ground_truth {
        Some(truth) => {
            let tp = modifying
                .iter()
                .filter(|d| truth.iter().any(|g| d.span.intersects(g.start, g.end)))
                .count();
            let misses = truth
                .iter()
                .filter(|g| !modifying.iter().any(|d| d.span.intersects(g.start, g.end)))
                .count();
            let precision = ratio(tp, modifying.len());
            let recall = ratio(tp, tp + misses);
            (precision, recall, MetricsBasis::GroundTruth, None)
        }
        None => {
            let tp = modifying.len();
            let uncovered = ctx
                .stats
                .deterministic_spans
                .saturating_sub(ctx.stats.deterministic_covered);
            let misses = uncovered + residual;
            let precision = ratio(tp, ctx.decisions.len());
            let recall = ratio(tp, tp + misses);
            (
                precision,
                recall,
                MetricsBasis::ApproximatedFromDeterministicCounts,
                Some(format!(
                    "approximation without ground truth: true positives = {} modifying decisions of {}; \
                     known misses = {} deterministic spans left unmodified + {} residual findings",
                    tp,
                    ctx.decisions.len(),
                    uncovered,
                    residual
                )),
            )
        }
    }
}

/// `num / den`, with an empty denominator counting as perfect.
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        1.0
    } else {
        num as f64 / den as f64
    }
}

fn recommendations(report: &QualityReport) -> Vec<String> {
    let mut out = Vec::new();
    let count = |kind: IssueKind| report.validation_issues.iter().filter(|i| i.kind == kind).count();

    if report.overall_score < OVERALL_SCORE_THRESHOLD {
        out.push(format!(
            "Overall quality score {:.2} is below {:.2}; review detector configuration and policy coverage",
            report.overall_score, OVERALL_SCORE_THRESHOLD
        ));
    }
    if report.precision < PRECISION_THRESHOLD {
        out.push(format!(
            "Precision {:.2} is below {:.2}; tighten detector patterns or add policy exceptions to reduce over-redaction",
            report.precision, PRECISION_THRESHOLD
        ));
    }
    if report.recall < RECALL_THRESHOLD {
        out.push(format!(
            "Recall {:.2} is below {:.2}; enable additional detector sources or extend pattern coverage",
            report.recall, RECALL_THRESHOLD
        ));
    }
    let critical = report
        .validation_issues
        .iter()
        .filter(|i| i.severity == Severity::Critical)
        .count();
    if critical > 0 {
        out.push(format!(
            "{} critical issue(s) found; do not publish this output before manual review",
            critical
        ));
    }
    let residual = count(IssueKind::ResidualPii);
    if residual > 0 {
        out.push(format!(
            "{} residual PII finding(s) remain in the output; add force rules or detector coverage for these types",
            residual
        ));
    }
    if count(IssueKind::SchemaViolation) + count(IssueKind::StructureProtected) > 0 {
        out.push("Structured input was affected; verify detector offsets target JSON string values only".to_string());
    }
    let ambiguous = count(IssueKind::AmbiguousPolicy);
    if ambiguous > 0 {
        out.push(format!(
            "{} ambiguous decision(s) were retained; add a force rule or judge pass to resolve them",
            ambiguous
        ));
    }
    if count(IssueKind::DetectorDegraded) > 0 {
        out.push("Some detector sources did not contribute; check timeouts and detector health".to_string());
    }
    out
}

/// Trim a scanner match to the longest run outside every replacement
/// artifact. `None` when nothing alphanumeric is left.
fn outside_artifacts(
    output: &str,
    index: &CharIndex,
    start: usize,
    end: usize,
    replacements: &[Replacement],
) -> Option<(usize, usize)> {
    let mut cuts: Vec<TextRange> = replacements
        .iter()
        .map(|r| r.output)
        .filter(|o| o.intersects(start, end))
        .collect();
    cuts.sort();

    let mut best: Option<(usize, usize)> = None;
    let mut cursor = start;
    for cut in cuts.iter().map(|c| (c.start.max(start), c.end.min(end))).chain([(end, end)]) {
        if cut.0 > cursor {
            let keep = index
                .slice(output, cursor, cut.0)
                .is_some_and(|s| s.chars().any(char::is_alphanumeric));
            if keep && best.map_or(true, |(s, e)| cut.0 - cursor > e - s) {
                best = Some((cursor, cut.0));
            }
        }
        cursor = cursor.max(cut.1);
    }
    best
}
