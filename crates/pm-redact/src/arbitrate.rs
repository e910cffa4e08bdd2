//! Weighted-vote arbitration over span clusters.
//!
//! Each cluster produced by the [`SpanCollector`](crate::cluster::SpanCollector)
//! is resolved into at most one [`Decision`]:
//!
//! 1. every member span votes for its entity type with its source weight
//!    (judge 3, finder 2, deterministic 1); confidence is advisory only
//! 2. force rules for any voted type override the vote, the most protective
//!    forced action winning
//! 3. otherwise the top-weighted type's policy rule decides; a top-weight
//!    tie between types whose policies disagree resolves to RETAIN and is
//!    flagged `ambiguous_policy`
//! 4. clusters whose winning type has no rule are dropped
//!
//! The decision range is the union of all member ranges. Since clusters are
//! maximal overlap groups, decision ranges never overlap each other.

use crate::cluster::Cluster;
use crate::policy::{Category, PolicyRule, PolicyStore, SensitivityLevel};
use crate::span::{CharIndex, EntityType, Source};
use crate::Action;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Write as _;
use tracing::{debug, trace};

/// Maximum characters of detector reasoning quoted in a rationale.
const REASONING_SNIPPET_CHARS: usize = 60;

/// Half-open character range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains_range(&self, start: usize, end: usize) -> bool {
        self.start <= start && end <= self.end
    }

    pub fn intersects(&self, start: usize, end: usize) -> bool {
        crate::span::ranges_intersect(self.start, self.end, start, end)
    }
}

/// One source's vote inside a tally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVote {
    pub source: Source,
    pub weight: u32,
    pub confidence: f64,
}

/// Total weight collected by one entity type in a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub entity_type: EntityType,
    pub total_weight: u32,
    pub votes: Vec<SourceVote>,
    #[serde(skip)]
    best_priority: u8,
    #[serde(skip)]
    first_seq: usize,
}

/// Machine-readable reasons attached to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RationaleFlag {
    ForceRule,
    PolicyRule,
    PolicyException,
    AmbiguousPolicy,
    TieBrokenBySource,
    TieBrokenByOrder,
    MergedSpan,
}

impl std::fmt::Display for RationaleFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RationaleFlag::ForceRule => "force_rule",
            RationaleFlag::PolicyRule => "policy_rule",
            RationaleFlag::PolicyException => "policy_exception",
            RationaleFlag::AmbiguousPolicy => "ambiguous_policy",
            RationaleFlag::TieBrokenBySource => "tie_broken_by_source",
            RationaleFlag::TieBrokenByOrder => "tie_broken_by_order",
            RationaleFlag::MergedSpan => "merged_span",
        };
        f.write_str(s)
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rationale {
    pub flags: Vec<RationaleFlag>,
    pub summary: String,
}

impl Rationale {
    pub fn has(&self, flag: RationaleFlag) -> bool {
        self.flags.contains(&flag)
    }

    fn push(&mut self, flag: RationaleFlag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }
}

/// The resolved outcome for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub span: TextRange,
    pub entity_type: EntityType,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    /// Sensitivity of the applied rule; for ambiguous decisions, the
    /// highest sensitivity among the tied candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity_level: Option<SensitivityLevel>,
    pub vote_breakdown: Vec<VoteTally>,
    pub rationale: Rationale,
    /// Sources that contributed at least one span.
    pub sources: Vec<Source>,
}

impl Decision {
    pub fn is_ambiguous(&self) -> bool {
        self.rationale.has(RationaleFlag::AmbiguousPolicy)
    }
}

/// Per-incident arbitration counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationStats {
    pub clusters: usize,
    pub decisions: usize,
    pub dropped_clusters: usize,
    pub force_rules_applied: usize,
    /// Clusters voting for more than one entity type.
    pub conflicts: usize,
    pub ambiguous: usize,
    pub redacted: usize,
    pub pseudonymized: usize,
    pub retained: usize,
    /// Deterministic spans seen, and those covered by a modifying decision.
    pub deterministic_spans: usize,
    pub deterministic_covered: usize,
}

impl ArbitrationStats {
    fn record(&mut self, action: Action) {
        match action {
            Action::Redact => self.redacted += 1,
            Action::Pseudonymize => self.pseudonymized += 1,
            Action::Retain => self.retained += 1,
        }
    }
}

/// Result of arbitrating every cluster of one document.
#[derive(Debug, Clone, Default)]
pub struct ArbitrationOutcome {
    /// Decisions ordered by start offset.
    pub decisions: Vec<Decision>,
    pub stats: ArbitrationStats,
}

/// Resolves clusters against a policy store.
#[derive(Debug, Clone, Copy)]
pub struct ArbitrationEngine<'p> {
    policy: &'p PolicyStore,
}

impl<'p> ArbitrationEngine<'p> {
    pub fn new(policy: &'p PolicyStore) -> Self {
        Self { policy }
    }

    /// Arbitrate all clusters of `text`.
    pub fn arbitrate(&self, text: &str, index: &CharIndex, clusters: &[Cluster]) -> ArbitrationOutcome {
        let mut outcome = ArbitrationOutcome::default();
        outcome.stats.clusters = clusters.len();

        for cluster in clusters {
            let det_spans = cluster.count_from(Source::Deterministic);
            outcome.stats.deterministic_spans += det_spans;
            if cluster.entity_types().len() > 1 {
                outcome.stats.conflicts += 1;
            }

            let value = index.slice(text, cluster.start, cluster.end).unwrap_or("");
            match self.resolve(cluster, value) {
                Some(decision) => {
                    if decision.rationale.has(RationaleFlag::ForceRule) {
                        outcome.stats.force_rules_applied += 1;
                    }
                    if decision.is_ambiguous() {
                        outcome.stats.ambiguous += 1;
                    }
                    if decision.action.is_modifying() {
                        outcome.stats.deterministic_covered += det_spans;
                    }
                    outcome.stats.record(decision.action);
                    trace!(
                        start = decision.span.start,
                        end = decision.span.end,
                        entity_type = %decision.entity_type,
                        action = %decision.action,
                        "cluster resolved"
                    );
                    outcome.decisions.push(decision);
                }
                None => {
                    outcome.stats.dropped_clusters += 1;
                    trace!(
                        start = cluster.start,
                        end = cluster.end,
                        "cluster dropped: no policy rule for winning type"
                    );
                }
            }
        }

        outcome.stats.decisions = outcome.decisions.len();
        debug!(
            clusters = outcome.stats.clusters,
            decisions = outcome.stats.decisions,
            dropped = outcome.stats.dropped_clusters,
            ambiguous = outcome.stats.ambiguous,
            "arbitration complete"
        );
        outcome
    }

    /// Resolve one cluster; `value` is the text under its union range.
    pub fn resolve(&self, cluster: &Cluster, value: &str) -> Option<Decision> {
        let tallies = tally(cluster);
        let top = tallies.first()?;
        let span = TextRange::new(cluster.start, cluster.end);
        let mut sources: Vec<Source> = cluster.spans.iter().map(|s| s.span.source).collect();
        sources.sort();
        sources.dedup();

        let mut rationale = Rationale::default();
        if cluster.is_merged() {
            rationale.push(RationaleFlag::MergedSpan);
        }

        if let Some((entity_type, rule)) = self.strongest_force_rule(&tallies) {
            rationale.push(RationaleFlag::ForceRule);
            rationale.summary = format!(
                "force rule {}/{} -> {} for {}; {}",
                rule.category,
                rule.sensitivity_level,
                rule.action,
                entity_type,
                describe_votes(cluster, &tallies)
            );
            return Some(Decision {
                span,
                entity_type: entity_type.clone(),
                action: rule.action,
                category: Some(rule.category),
                sensitivity_level: Some(rule.sensitivity_level),
                vote_breakdown: tallies,
                rationale,
                sources,
            });
        }

        let tied: Vec<&VoteTally> = tallies
            .iter()
            .filter(|t| t.total_weight == top.total_weight)
            .collect();

        if tied.len() > 1 {
            let resolved: Vec<(Action, Option<&PolicyRule>)> = tied
                .iter()
                .map(|t| self.resolve_action(&t.entity_type, value))
                .collect();
            let first_action = resolved[0].0;
            if resolved.iter().any(|(a, _)| *a != first_action) {
                let sensitivity = resolved
                    .iter()
                    .filter_map(|(_, r)| r.map(|r| r.sensitivity_level))
                    .max();
                rationale.push(RationaleFlag::AmbiguousPolicy);
                rationale.summary = format!(
                    "ambiguous: {} tie at weight {} with conflicting policies; retained; {}",
                    tied.iter()
                        .map(|t| t.entity_type.as_str())
                        .collect::<Vec<_>>()
                        .join("/"),
                    top.total_weight,
                    describe_votes(cluster, &tallies)
                );
                return Some(Decision {
                    span,
                    entity_type: top.entity_type.clone(),
                    action: Action::Retain,
                    category: None,
                    sensitivity_level: sensitivity,
                    vote_breakdown: tallies.clone(),
                    rationale,
                    sources,
                });
            }
            let runner_up = tied[1];
            if top.best_priority > runner_up.best_priority {
                rationale.push(RationaleFlag::TieBrokenBySource);
            } else {
                rationale.push(RationaleFlag::TieBrokenByOrder);
            }
        }

        let winner = top.entity_type.clone();
        let rule = self.policy.rule_for(&winner)?;
        let (action, _) = self.resolve_action(&winner, value);
        rationale.push(RationaleFlag::PolicyRule);
        if action != rule.action {
            rationale.push(RationaleFlag::PolicyException);
        }
        rationale.summary = format!(
            "{} wins with weight {}; rule {}/{} -> {}{}; {}",
            winner,
            top.total_weight,
            rule.category,
            rule.sensitivity_level,
            rule.action,
            if action != rule.action { " (exception: retained)" } else { "" },
            describe_votes(cluster, &tallies)
        );

        Some(Decision {
            span,
            entity_type: winner,
            action,
            category: Some(rule.category),
            sensitivity_level: Some(rule.sensitivity_level),
            vote_breakdown: tallies,
            rationale,
            sources,
        })
    }

    /// Action for an entity type's rule applied to a value, with the rule.
    fn resolve_action(&self, entity_type: &EntityType, value: &str) -> (Action, Option<&'p PolicyRule>) {
        match self.policy.rule_for(entity_type) {
            Some(rule) => {
                let canonical = self.policy.canonicalizer().canonicalize(entity_type, value);
                if rule.is_exception(&canonical) {
                    (Action::Retain, Some(rule))
                } else {
                    (rule.action, Some(rule))
                }
            }
            None => (Action::Retain, None),
        }
    }

    /// Most protective force rule among the voted types. Equal actions
    /// keep the higher-ranked tally.
    fn strongest_force_rule<'t>(&self, tallies: &'t [VoteTally]) -> Option<(&'t EntityType, &'p PolicyRule)> {
        let mut best: Option<(&EntityType, &PolicyRule)> = None;
        for t in tallies {
            if let Some(rule) = self.policy.force_rule_for(&t.entity_type) {
                let replace = match best {
                    None => true,
                    Some((_, b)) => rule.action.protection_rank() > b.action.protection_rank(),
                };
                if replace {
                    best = Some((&t.entity_type, rule));
                }
            }
        }
        best
    }
}

/// Weighted tallies ordered by weight, then best source priority, then
/// earliest registration.
fn tally(cluster: &Cluster) -> Vec<VoteTally> {
    let mut tallies: Vec<VoteTally> = Vec::new();
    for reg in &cluster.spans {
        let s = &reg.span;
        let vote = SourceVote {
            source: s.source,
            weight: s.source.weight(),
            confidence: s.confidence,
        };
        match tallies.iter_mut().find(|t| t.entity_type == s.entity_type) {
            Some(t) => {
                t.total_weight += vote.weight;
                t.best_priority = t.best_priority.max(s.source.priority());
                t.first_seq = t.first_seq.min(reg.seq);
                t.votes.push(vote);
            }
            None => tallies.push(VoteTally {
                entity_type: s.entity_type.clone(),
                total_weight: vote.weight,
                best_priority: s.source.priority(),
                first_seq: reg.seq,
                votes: vec![vote],
            }),
        }
    }
    tallies.sort_by(compare_tallies);
    tallies
}

fn compare_tallies(a: &VoteTally, b: &VoteTally) -> Ordering {
    b.total_weight
        .cmp(&a.total_weight)
        .then(b.best_priority.cmp(&a.best_priority))
        .then(a.first_seq.cmp(&b.first_seq))
}

fn describe_votes(cluster: &Cluster, tallies: &[VoteTally]) -> String {
    let mut out = String::from("votes:");
    for t in tallies {
        let _ = write!(out, " {}={}", t.entity_type, t.total_weight);
        let parts: Vec<String> = t
            .votes
            .iter()
            .map(|v| format!("{}:{}@{:.2}", v.source, v.weight, v.confidence))
            .collect();
        let _ = write!(out, " [{}]", parts.join(", "));
    }
    for reg in &cluster.spans {
        if let Some(reasoning) = reg.span.reasoning.as_deref() {
            let snippet: String = reasoning.chars().take(REASONING_SNIPPET_CHARS).collect();
            let ellipsis = if reasoning.chars().count() > REASONING_SNIPPET_CHARS { "..." } else { "" };
            let _ = write!(out, "; {} says \"{}{}\"", reg.span.source, snippet, ellipsis);
        }
    }
    out
}
