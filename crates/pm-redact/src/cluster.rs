//! Span collection and overlap clustering.

use crate::span::{clamp_confidence, EntityType, Source, Span};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, trace};

/// A span together with its registration order.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredSpan {
    /// Order in which the collector accepted the span; breaks final ties.
    pub seq: usize,
    pub span: Span,
}

/// A maximal group of transitively overlapping spans.
#[derive(Debug, Clone)]
pub struct Cluster {
    /// Member spans, ordered by start offset then registration order.
    pub spans: Vec<RegisteredSpan>,
    /// Union range start.
    pub start: usize,
    /// Union range end.
    pub end: usize,
}

impl Cluster {
    /// Distinct entity types voted for in this cluster.
    pub fn entity_types(&self) -> Vec<&EntityType> {
        let mut out: Vec<&EntityType> = Vec::new();
        for s in &self.spans {
            if !out.contains(&&s.span.entity_type) {
                out.push(&s.span.entity_type);
            }
        }
        out
    }

    /// Whether members disagree on their ranges.
    pub fn is_merged(&self) -> bool {
        self.spans
            .iter()
            .any(|s| s.span.start != self.start || s.span.end != self.end)
    }

    /// Number of member spans from a given source.
    pub fn count_from(&self, source: Source) -> usize {
        self.spans.iter().filter(|s| s.span.source == source).count()
    }
}

/// Counters reported by the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    pub received: usize,
    pub accepted: usize,
    pub invalid_spans: usize,
    pub duplicate_spans: usize,
    /// Same-source overlaps (tolerated, clustered normally).
    pub same_source_overlaps: usize,
}

/// Collects spans for one document and groups them into clusters.
#[derive(Debug)]
pub struct SpanCollector {
    char_len: usize,
    spans: Vec<RegisteredSpan>,
    seen: HashSet<(usize, usize, EntityType, Source)>,
    stats: CollectorStats,
}

impl SpanCollector {
    /// Collector for a document of `char_len` characters.
    pub fn new(char_len: usize) -> Self {
        Self {
            char_len,
            spans: Vec::new(),
            seen: HashSet::new(),
            stats: CollectorStats::default(),
        }
    }

    /// Register a span. Returns false when it was rejected (out of bounds,
    /// empty) or is an exact duplicate.
    pub fn add(&mut self, mut span: Span) -> bool {
        self.stats.received += 1;
        span.confidence = clamp_confidence(span.confidence);

        if span.start >= span.end || span.end > self.char_len {
            self.stats.invalid_spans += 1;
            debug!(
                start = span.start,
                end = span.end,
                source = %span.source,
                char_len = self.char_len,
                "rejecting span outside document bounds"
            );
            return false;
        }

        let key = (span.start, span.end, span.entity_type.clone(), span.source);
        if !self.seen.insert(key) {
            self.stats.duplicate_spans += 1;
            trace!(start = span.start, end = span.end, "duplicate span dropped");
            return false;
        }

        let seq = self.spans.len();
        self.spans.push(RegisteredSpan { seq, span });
        self.stats.accepted += 1;
        true
    }

    /// Register every span of an iterator.
    pub fn extend<I: IntoIterator<Item = Span>>(&mut self, spans: I) {
        for span in spans {
            self.add(span);
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    /// Group the collected spans into clusters, ordered by start offset.
    pub fn into_clusters(mut self) -> (Vec<Cluster>, CollectorStats) {
        self.spans
            .sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.seq.cmp(&b.seq)));

        let mut clusters: Vec<Cluster> = Vec::new();
        for reg in self.spans {
            match clusters.last_mut() {
                // Sorted by start: anything starting before the running
                // union end intersects at least one member.
                Some(current) if reg.span.start < current.end => {
                    if current
                        .spans
                        .iter()
                        .any(|m| m.span.source == reg.span.source && m.span.intersects(&reg.span))
                    {
                        self.stats.same_source_overlaps += 1;
                    }
                    current.end = current.end.max(reg.span.end);
                    current.spans.push(reg);
                }
                _ => clusters.push(Cluster {
                    start: reg.span.start,
                    end: reg.span.end,
                    spans: vec![reg],
                }),
            }
        }

        if self.stats.same_source_overlaps > 0 {
            debug!(
                overlaps = self.stats.same_source_overlaps,
                "detector reported overlapping spans from one source"
            );
        }
        (clusters, self.stats)
    }
}
