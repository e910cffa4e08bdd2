//! Shipped detector sources.

use crate::dispatch::{CancellationToken, DetectorSource, DispatchError, IncidentDocument};
use pm_redact::{PatternScanner, Source, Span};

/// Spans computed upstream and supplied in the batch input.
#[derive(Debug, Clone)]
pub struct PrecomputedDetector {
    source: Source,
    name: String,
    spans: Vec<Span>,
}

impl PrecomputedDetector {
    pub fn new(source: Source, spans: Vec<Span>) -> Self {
        Self {
            source,
            name: format!("precomputed-{}", source),
            spans,
        }
    }
}

impl DetectorSource for PrecomputedDetector {
    fn source(&self) -> Source {
        self.source
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, _doc: &IncidentDocument, _cancel: &CancellationToken) -> Result<Vec<Span>, DispatchError> {
        Ok(self.spans.clone())
    }
}

/// The built-in regex scanner as a deterministic source.
#[derive(Debug, Clone, Default)]
pub struct PatternDetector {
    scanner: PatternScanner,
}

impl PatternDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DetectorSource for PatternDetector {
    fn source(&self) -> Source {
        Source::Deterministic
    }

    fn name(&self) -> &str {
        "builtin-patterns"
    }

    fn detect(&self, doc: &IncidentDocument, cancel: &CancellationToken) -> Result<Vec<Span>, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        Ok(self.scanner.scan_text(&doc.text))
    }
}
