//! CLI plumbing shared by the `pm-scrub` binary and its tests.

use crate::batch::{BatchError, BatchInput, BatchReport};
use crate::config::{ConfigError, ScrubConfig};
use crate::exit_codes::ExitCode;
use pm_redact::RedactionError;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholder shown instead of configured key material.
pub const MASKED: &str = "***";

/// Errors surfaced by CLI commands, each mapped to a stable exit code.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Args(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Redaction(#[from] RedactionError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize output: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl CliError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Args(_) => ExitCode::ArgsError,
            CliError::Config(ConfigError::IoError { .. }) => ExitCode::IoError,
            CliError::Config(_) => ExitCode::ConfigError,
            CliError::Batch(BatchError::Io { .. }) => ExitCode::IoError,
            CliError::Batch(_) => ExitCode::ArgsError,
            CliError::Redaction(e) if e.is_fatal_for_run() => ExitCode::ConfigError,
            CliError::Redaction(RedactionError::IoError(_)) => ExitCode::IoError,
            CliError::Redaction(_) => ExitCode::InternalError,
            CliError::Io { .. } => ExitCode::IoError,
            CliError::Serialize(_) => ExitCode::InternalError,
        }
    }
}

/// Read batch input from a file, or stdin for `-`.
pub fn read_batch_input(path: &Path) -> Result<BatchInput, CliError> {
    if path == Path::new("-") {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .map_err(|source| CliError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        return Ok(BatchInput::from_json(&content)?);
    }
    Ok(BatchInput::load(path)?)
}

/// Serialize a report.
pub fn render_report(report: &BatchReport, pretty: bool) -> Result<String, CliError> {
    let rendered = if pretty {
        serde_json::to_string_pretty(report)
    } else {
        serde_json::to_string(report)
    };
    rendered.map_err(CliError::Serialize)
}

/// Write output to a file, or stdout when `path` is `None`.
pub fn write_output(path: Option<&Path>, content: &str) -> Result<(), CliError> {
    match path {
        Some(path) => std::fs::write(path, format!("{}\n", content)).map_err(|source| CliError::Io {
            path: path.to_path_buf(),
            source,
        }),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", content).map_err(|source| CliError::Io {
                path: PathBuf::from("<stdout>"),
                source,
            })
        }
    }
}

/// Copy of the config safe to print.
pub fn masked_config(config: &ScrubConfig) -> ScrubConfig {
    let mut masked = config.clone();
    if masked.pseudonym.salt.is_some() {
        masked.pseudonym.salt = Some(MASKED.to_string());
    }
    if masked.pseudonym.key_base64.is_some() {
        masked.pseudonym.key_base64 = Some(MASKED.to_string());
    }
    masked
}
