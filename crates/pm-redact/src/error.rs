//! Error types for the redaction engine.

use crate::span::Source;
use std::time::Duration;
use thiserror::Error;

/// Result type for redaction operations.
pub type Result<T> = std::result::Result<T, RedactionError>;

/// Errors that can occur while loading policy or processing an incident.
///
/// Only configuration and mandatory-detector failures are fatal. Ambiguous
/// arbitration, residual PII and schema damage are recovered locally and
/// surfaced as validation issues instead (see [`crate::validate::IssueKind`]).
#[derive(Error, Debug)]
pub enum RedactionError {
    /// Malformed or missing policy. Aborts the run before any incident.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A detector source did not answer within its budget.
    #[error("detector '{detector}' timed out after {elapsed:?}")]
    DetectorTimeout { detector: Source, elapsed: Duration },

    /// A source the policy marks mandatory failed or timed out.
    /// Aborts the affected incident only.
    #[error("mandatory detector '{detector}' failed: {reason}")]
    MandatoryDetectorFailure { detector: Source, reason: String },

    /// Failed to load or derive pseudonym key material.
    #[error("key error: {0}")]
    KeyError(String),

    /// Failed to compile a regex pattern.
    #[error("pattern error: {0}")]
    PatternError(String),

    /// I/O error during policy file operations.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Internal error that should never expose raw data.
    /// The message is sanitized to prevent PII leakage.
    #[error("internal error (details redacted for safety)")]
    InternalError,
}

impl RedactionError {
    /// Create an internal error, ensuring no sensitive data is exposed.
    pub fn internal() -> Self {
        RedactionError::InternalError
    }

    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        RedactionError::ConfigurationError(msg.into())
    }

    /// Whether this error aborts the whole run rather than one incident.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            RedactionError::ConfigurationError(_)
                | RedactionError::KeyError(_)
                | RedactionError::PatternError(_)
        )
    }
}
