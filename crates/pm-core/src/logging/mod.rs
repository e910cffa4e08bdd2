//! Structured logging for pm-core.
//!
//! Provides dual-mode logging:
//! - Human-readable console output for interactive use
//! - Machine-parseable JSONL for pipelines
//!
//! stdout is reserved for the batch report; all log output goes to stderr.
//! Log events carry incident ids, entity types, counts and hashes, never
//! the text a span covers.

pub mod config;

pub use config::{LogConfig, LogFormat};

use sha2::{Digest, Sha256};
use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem.
///
/// Must be called once at startup before any logging occurs. A `RUST_LOG`
/// directive string, when valid, replaces the level-derived filter.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "pm_core={level},pm_redact={level},pm_scrub={level}",
            level = config.level
        ))
    });

    match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(use_ansi);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
        }
        LogFormat::Jsonl => {
            let jsonl_layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(jsonl_layer)
                .init();
        }
    }
}

/// Generate a unique run ID for this invocation.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    // Shorten to first 12 hex chars for readability
    format!("run-{}", &uuid.to_string()[..12])
}

/// Short stable fingerprint of a string, safe to log in place of the value.
pub fn fingerprint_for_log(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id() {
        let id1 = generate_run_id();
        let id2 = generate_run_id();

        assert!(id1.starts_with("run-"));
        assert_ne!(id1, id2);
        // Format: run-<12 chars>
        assert_eq!(id1.len(), 16);
    }

    #[test]
    fn test_fingerprint_is_stable_and_opaque() {
        let a = fingerprint_for_log("john.doe@company.com");
        assert_eq!(a, fingerprint_for_log("john.doe@company.com"));
        assert_eq!(a.len(), 12);
        assert!(!a.contains("john"));
    }

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Human);
        assert_eq!(config.level, tracing_subscriber::filter::LevelFilter::INFO);
    }
}
