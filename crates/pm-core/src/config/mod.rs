//! Configuration loading and validation for pm-core.
//!
//! This module handles:
//! - Loading config.json (driver settings) and policy.json (redaction policy)
//! - Config resolution order (CLI > env > XDG > defaults)
//! - Schema validation (shape/type checking via serde)
//! - Semantic validation (positive limits, key material)
//! - Config snapshot generation for batch reports

use pm_redact::{KeyMaterial, PolicyStore, RedactionError, Source};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Schema version for config.json.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";

/// Default XDG config directory name.
const CONFIG_DIR_NAME: &str = "pm_scrub";

/// Environment variable naming the config directory.
pub const CONFIG_DIR_ENV: &str = "PM_SCRUB_CONFIG";

/// Default per-source detector timeout.
pub const DEFAULT_DETECTOR_TIMEOUT_MS: u64 = 30_000;

/// Default number of incidents processed at once.
pub const DEFAULT_MAX_PARALLEL_INCIDENTS: usize = 4;

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid JSON in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Schema validation failed for {path}: {message}")]
    SchemaError { path: PathBuf, message: String },

    #[error("Invalid policy{}: {source}", display_path(.path))]
    PolicyError {
        path: Option<PathBuf>,
        #[source]
        source: RedactionError,
    },

    #[error("Invalid pseudonym key: {0}")]
    KeyError(#[source] RedactionError),

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

/// Detector dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Timeout applied to any source without an override.
    pub default_timeout_ms: u64,
    /// Per-source overrides, e.g. `{"judge": 60000}`.
    pub timeouts_ms: BTreeMap<Source, u64>,
    /// Sources dispatched at once for one incident.
    pub max_concurrent_sources: usize,
    /// Run the built-in regex detector alongside supplied detections.
    pub enable_builtin_patterns: bool,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_DETECTOR_TIMEOUT_MS,
            timeouts_ms: BTreeMap::new(),
            max_concurrent_sources: Source::ALL.len(),
            enable_builtin_patterns: false,
        }
    }
}

impl DetectorSettings {
    /// Effective timeout for a source.
    pub fn timeout_for(&self, source: Source) -> Duration {
        let ms = self
            .timeouts_ms
            .get(&source)
            .copied()
            .unwrap_or(self.default_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Batch execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_parallel_incidents: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_parallel_incidents: DEFAULT_MAX_PARALLEL_INCIDENTS,
        }
    }
}

/// Pseudonym key settings. With neither `salt` nor `key_base64`, each run
/// gets a fresh random key and tokens are only stable within that run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudonymSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_base64: Option<String>,
    pub key_id: String,
}

impl Default for PseudonymSettings {
    fn default() -> Self {
        Self {
            salt: None,
            key_base64: None,
            key_id: pm_redact::hash::DEFAULT_KEY_ID.to_string(),
        }
    }
}

impl PseudonymSettings {
    /// Key material from the configured salt or key, if any.
    pub fn key_material(&self) -> Result<Option<KeyMaterial>, ConfigError> {
        let key = match (&self.salt, &self.key_base64) {
            (Some(salt), None) => Some(KeyMaterial::from_salt(salt, &self.key_id)),
            (None, Some(encoded)) => Some(KeyMaterial::from_base64(encoded, &self.key_id)),
            (None, None) => None,
            (Some(_), Some(_)) => {
                return Err(ConfigError::KeyError(RedactionError::KeyError(
                    "salt and key_base64 are mutually exclusive".to_string(),
                )))
            }
        };
        key.transpose().map_err(ConfigError::KeyError)
    }

    /// Whether any secret material is configured.
    pub fn has_secret(&self) -> bool {
        self.salt.is_some() || self.key_base64.is_some()
    }

    /// Key for one run: the configured one, else a fresh random key.
    pub fn run_key(&self) -> Result<KeyMaterial, ConfigError> {
        match self.key_material()? {
            Some(key) => Ok(key),
            None => KeyMaterial::from_salt(&uuid::Uuid::new_v4().to_string(), &self.key_id)
                .map_err(ConfigError::KeyError),
        }
    }
}

/// Report settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    /// Include canonical original values in pseudonym mappings.
    pub include_original_values: bool,
    /// Pretty-print the JSON report.
    pub pretty: bool,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            include_original_values: false,
            pretty: true,
        }
    }
}

/// Driver configuration (config.json).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubConfig {
    pub schema_version: String,
    pub detectors: DetectorSettings,
    pub batch: BatchSettings,
    pub pseudonym: PseudonymSettings,
    pub report: ReportSettings,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            detectors: DetectorSettings::default(),
            batch: BatchSettings::default(),
            pseudonym: PseudonymSettings::default(),
            report: ReportSettings::default(),
        }
    }
}

impl ScrubConfig {
    /// Semantic checks serde cannot express.
    pub fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let fail = |message: &str| ConfigError::SchemaError {
            path: path.to_path_buf(),
            message: message.to_string(),
        };
        if self.detectors.default_timeout_ms == 0 {
            return Err(fail("detectors.default_timeout_ms must be positive"));
        }
        if self.detectors.timeouts_ms.values().any(|ms| *ms == 0) {
            return Err(fail("detectors.timeouts_ms entries must be positive"));
        }
        if self.detectors.max_concurrent_sources == 0 {
            return Err(fail("detectors.max_concurrent_sources must be at least 1"));
        }
        if self.batch.max_parallel_incidents == 0 {
            return Err(fail("batch.max_parallel_incidents must be at least 1"));
        }
        if self.pseudonym.key_id.trim().is_empty() {
            return Err(fail("pseudonym.key_id must not be empty"));
        }
        self.pseudonym.key_material()?;
        Ok(())
    }
}

/// Resolved configuration with provenance information.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The loaded driver configuration.
    pub scrub: ScrubConfig,
    /// Path to config.json (None if using defaults).
    pub config_path: Option<PathBuf>,
    /// SHA-256 of config.json content (None if using defaults).
    pub config_hash: Option<String>,

    /// The validated policy.
    pub policy: PolicyStore,
    /// Path to the policy file (None if using the built-in policy).
    pub policy_path: Option<PathBuf>,

    /// The config directory used for resolution.
    pub config_dir: PathBuf,
}

impl ResolvedConfig {
    /// Create a config snapshot for reports.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            config_path: self.config_path.clone(),
            config_hash: self.config_hash.clone(),
            config_schema_version: self.scrub.schema_version.clone(),
            policy_path: self.policy_path.clone(),
            policy_hash: self.policy.content_hash().to_string(),
            policy_schema_version: self.policy.config().schema_version.clone(),
            mandatory_sources: self.policy.mandatory_sources().collect(),
            config_dir: self.config_dir.clone(),
        }
    }
}

/// Config snapshot for reports and `show-config`. Never carries key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub config_path: Option<PathBuf>,
    pub config_hash: Option<String>,
    pub config_schema_version: String,
    pub policy_path: Option<PathBuf>,
    pub policy_hash: String,
    pub policy_schema_version: String,
    pub mandatory_sources: Vec<Source>,
    pub config_dir: PathBuf,
}

/// Configuration resolution options.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    /// Explicit config directory (highest priority).
    pub config_dir: Option<PathBuf>,
    /// Explicit config.json path.
    pub config_path: Option<PathBuf>,
    /// Explicit policy file path.
    pub policy_path: Option<PathBuf>,
}

/// Load configuration with the standard resolution order.
///
/// Resolution order (highest to lowest priority):
/// 1. Explicit CLI flags (via ConfigOptions)
/// 2. Environment variable (PM_SCRUB_CONFIG)
/// 3. XDG config home (~/.config/pm_scrub/)
/// 4. Built-in defaults
///
/// Any failure here is a configuration error and aborts the run before
/// the first incident.
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    let config_dir = resolve_config_dir(options);

    let (scrub, config_path, config_hash) = load_scrub_config(&config_dir, &options.config_path)?;
    let (policy, policy_path) = load_policy(&config_dir, &options.policy_path)?;

    tracing::debug!(
        config_dir = %config_dir.display(),
        config_file = config_path.is_some(),
        policy_file = policy_path.is_some(),
        policy_hash = %policy.content_hash(),
        "configuration resolved"
    );

    Ok(ResolvedConfig {
        scrub,
        config_path,
        config_hash,
        policy,
        policy_path,
        config_dir,
    })
}

/// Resolve the config directory using the standard resolution order.
fn resolve_config_dir(options: &ConfigOptions) -> PathBuf {
    // 1. Explicit option
    if let Some(dir) = &options.config_dir {
        return dir.clone();
    }

    // 2. Environment variable
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }

    // 3. XDG config home
    let xdg_config = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        });

    xdg_config.join(CONFIG_DIR_NAME)
}

/// Load driver configuration.
fn load_scrub_config(
    config_dir: &Path,
    explicit_path: &Option<PathBuf>,
) -> Result<(ScrubConfig, Option<PathBuf>, Option<String>), ConfigError> {
    // An explicit path must exist
    if let Some(path) = explicit_path {
        if !path.exists() {
            return Err(ConfigError::NotFound { path: path.clone() });
        }
        let (config, hash) = load_scrub_config_from_file(path)?;
        return Ok((config, Some(path.clone()), Some(hash)));
    }

    let default_path = config_dir.join("config.json");
    if default_path.exists() {
        let (config, hash) = load_scrub_config_from_file(&default_path)?;
        return Ok((config, Some(default_path), Some(hash)));
    }

    Ok((ScrubConfig::default(), None, None))
}

/// Load a driver config from a specific file.
pub fn load_scrub_config_from_file(path: &Path) -> Result<(ScrubConfig, String), ConfigError> {
    let content = read_file(path)?;
    let hash = compute_hash(&content);

    let config: ScrubConfig = serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;

    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(ConfigError::VersionMismatch {
            expected: CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }
    config.validate(path)?;

    Ok((config, hash))
}

/// Load the policy.
fn load_policy(
    config_dir: &Path,
    explicit_path: &Option<PathBuf>,
) -> Result<(PolicyStore, Option<PathBuf>), ConfigError> {
    if let Some(path) = explicit_path {
        if !path.exists() {
            return Err(ConfigError::NotFound { path: path.clone() });
        }
        return Ok((load_policy_from_file(path)?, Some(path.clone())));
    }

    let default_path = config_dir.join("policy.json");
    if default_path.exists() {
        return Ok((load_policy_from_file(&default_path)?, Some(default_path)));
    }

    let policy = PolicyStore::builtin().map_err(|source| ConfigError::PolicyError { path: None, source })?;
    Ok((policy, None))
}

/// Load and validate a policy file.
pub fn load_policy_from_file(path: &Path) -> Result<PolicyStore, ConfigError> {
    let content = read_file(path)?;
    PolicyStore::from_json(&content).map_err(|source| ConfigError::PolicyError {
        path: Some(path.to_path_buf()),
        source,
    })
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// SHA-256 of file content, hex encoded.
fn compute_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
