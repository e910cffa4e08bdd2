//! Logging configuration.
//!
//! Resolved from PM_LOG, RUST_LOG and PM_LOG_FORMAT, then the CLI flags
//! (-v/-q, --log-format).

use clap::ValueEnum;
use std::str::FromStr;
use tracing_subscriber::filter::LevelFilter;

/// Log output format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable console lines.
    #[default]
    Human,
    /// One JSON object per line.
    #[value(alias = "json")]
    Jsonl,
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LevelFilter,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Human,
            level: LevelFilter::INFO,
        }
    }
}

impl LogConfig {
    /// Create config from environment and CLI overrides.
    pub fn from_env(cli_level: Option<LevelFilter>, cli_format: Option<LogFormat>) -> Self {
        let pm_log = std::env::var("PM_LOG").ok();
        let rust_log = std::env::var("RUST_LOG").ok();
        let pm_log_format = std::env::var("PM_LOG_FORMAT").ok();
        Self::resolve(
            pm_log.as_deref(),
            rust_log.as_deref(),
            pm_log_format.as_deref(),
            cli_level,
            cli_format,
        )
    }

    /// Resolution without touching the process environment.
    ///
    /// PM_LOG takes precedence over RUST_LOG; CLI values override both.
    /// Unparseable values are ignored.
    pub fn resolve(
        pm_log: Option<&str>,
        rust_log: Option<&str>,
        pm_log_format: Option<&str>,
        cli_level: Option<LevelFilter>,
        cli_format: Option<LogFormat>,
    ) -> Self {
        let mut config = LogConfig::default();

        let env_level = match pm_log {
            Some(val) => LevelFilter::from_str(val.trim()).ok(),
            None => rust_log.and_then(most_verbose_directive),
        };
        if let Some(level) = cli_level.or(env_level) {
            config.level = level;
        }

        let env_format = pm_log_format.and_then(|v| <LogFormat as ValueEnum>::from_str(v.trim(), true).ok());
        if let Some(format) = cli_format.or(env_format) {
            config.format = format;
        }

        config
    }
}

/// Most verbose level named in a RUST_LOG directive list
/// (`warn,pm_core=debug` gives DEBUG).
fn most_verbose_directive(directives: &str) -> Option<LevelFilter> {
    directives
        .split(',')
        .filter_map(|d| {
            let level = d.rsplit('=').next().unwrap_or(d);
            LevelFilter::from_str(level.trim()).ok()
        })
        .max()
}
