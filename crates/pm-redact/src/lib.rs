//! Decision arbitration and redaction engine for post-incident records.
//!
//! Several independent PII detectors (rule based, LLM finder, LLM judge)
//! report candidate spans over the same incident text. This crate turns
//! those disagreeing signals into one conflict-free decision per text
//! region, rewrites the text, and checks that the result is clean.
//!
//! # Pipeline
//!
//! - [`PolicyStore`]: validated, read-only category/sensitivity/action rules
//! - [`SpanCollector`]: normalizes spans and groups overlaps into clusters
//! - [`ArbitrationEngine`]: weighted voting plus force rules, one
//!   [`Decision`] per cluster
//! - [`PseudonymRegistry`]: stable run-scoped tokens such as `Person_3fa9c2d1`
//! - [`RedactionApplier`]: right-to-left rewriting, JSON-aware
//! - [`QualityValidator`]: residual scan, schema and consistency checks,
//!   metrics and recommendations
//!
//! [`RedactionEngine`] chains all of them for one incident.
//!
//! # Example
//!
//! ```no_run
//! use pm_redact::{IncidentInput, KeyMaterial, PolicyStore, PseudonymRegistry, RedactionEngine, Source, Span};
//! use std::sync::Arc;
//!
//! let policy = Arc::new(PolicyStore::builtin().unwrap());
//! let engine = RedactionEngine::new(policy);
//! let registry = PseudonymRegistry::new(KeyMaterial::from_salt("run-salt", "run").unwrap());
//!
//! let input = IncidentInput::new("INC-1", "Contact: john.doe@company.com")
//!     .with_spans(vec![Span::new(9, 29, "EMAIL", Source::Deterministic)]);
//! let report = engine.process(&input, &registry).unwrap();
//! assert_eq!(report.processed_text, "Contact: [REDACTED_EMAIL]");
//! ```

pub mod action;
pub mod apply;
pub mod arbitrate;
pub mod canonicalize;
pub mod cluster;
pub mod detect;
pub mod engine;
pub mod error;
pub mod hash;
pub mod policy;
pub mod pseudonym;
pub mod span;
pub mod structured;
pub mod validate;

pub use action::Action;
pub use apply::{ApplyOutcome, RedactionApplier, Replacement};
pub use arbitrate::{ArbitrationEngine, ArbitrationStats, Decision, Rationale, RationaleFlag, TextRange};
pub use canonicalize::{Canonicalizer, CANONICALIZATION_VERSION};
pub use cluster::{Cluster, SpanCollector};
pub use detect::PatternScanner;
pub use engine::{EngineOptions, IncidentInput, IncidentReport, IncidentStats, RedactionEngine};
pub use error::{RedactionError, Result};
pub use hash::KeyMaterial;
pub use policy::{Category, PolicyConfig, PolicyStore, SensitivityLevel, POLICY_SCHEMA_VERSION};
pub use pseudonym::{MappingRecord, PseudonymEntry, PseudonymRegistry};
pub use span::{CharIndex, EntityType, Source, Span};
pub use validate::{
    GroundTruthSpan, IssueKind, MetricsBasis, QualityReport, QualityValidator, ResidualScanner, Severity,
    ValidationIssue,
};
