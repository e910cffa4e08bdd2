//! Redaction policy configuration and the read-only policy store.
//!
//! A policy document names detection *patterns* (which entity types they
//! cover) and *policies* (what to do with a category of patterns at a given
//! sensitivity). [`PolicyStore`] validates the document once and flattens
//! it into a per-entity-type lookup table; nothing mutates it afterwards.

use crate::canonicalize::Canonicalizer;
use crate::error::{RedactionError, Result};
use crate::span::{EntityType, Source};
use crate::Action;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// Schema version for the policy file.
pub const POLICY_SCHEMA_VERSION: &str = "1.0.0";

/// Category of sensitive data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Pii,
    OperationalIdentifiers,
    Secrets,
    CustomerOrgInfo,
    Miscellaneous,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::Pii => "PII",
            Category::OperationalIdentifiers => "OPERATIONAL_IDENTIFIERS",
            Category::Secrets => "SECRETS",
            Category::CustomerOrgInfo => "CUSTOMER_ORG_INFO",
            Category::Miscellaneous => "MISCELLANEOUS",
        };
        write!(f, "{}", s)
    }
}

/// Sensitivity level of a policy rule, least sensitive first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensitivityLevel {
    /// Usually retained.
    Minimum,
    /// Retain or pseudonymize.
    Low,
    /// Usually pseudonymize.
    Medium,
    /// Redact or pseudonymize.
    High,
    /// Always redact.
    Critical,
}

impl std::fmt::Display for SensitivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SensitivityLevel::Minimum => "MINIMUM",
            SensitivityLevel::Low => "LOW",
            SensitivityLevel::Medium => "MEDIUM",
            SensitivityLevel::High => "HIGH",
            SensitivityLevel::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// A named detection pattern and the entity types it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternDef {
    pub name: String,
    pub category: Category,
    /// Backing-detector entity labels (e.g. `EMAIL_ADDRESS`, `PERSON`).
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A policy rule as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDef {
    pub category: Category,
    pub sensitivity_level: SensitivityLevel,
    pub action: Action,
    /// Names of the patterns this rule applies to.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Force rules override arbitration unconditionally.
    #[serde(default)]
    pub force: bool,
    /// Literal values this rule retains (ignored by force rules).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<String>,
}

/// The policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default)]
    pub patterns: Vec<PatternDef>,
    #[serde(default)]
    pub policies: Vec<PolicyDef>,
    /// Sources whose failure aborts an incident instead of degrading it.
    #[serde(default)]
    pub mandatory_sources: Vec<Source>,
}

fn default_schema_version() -> String {
    POLICY_SCHEMA_VERSION.to_string()
}

/// A policy rule resolved for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyRule {
    pub category: Category,
    pub sensitivity_level: SensitivityLevel,
    pub action: Action,
    /// Entity types this rule matched through its patterns.
    pub matched_entity_types: Vec<EntityType>,
    pub force: bool,
    /// Name of the pattern that bound this entity type to the rule.
    pub pattern: String,
    #[serde(skip)]
    exceptions: HashSet<String>,
}

impl PolicyRule {
    /// Whether a canonical value is listed as an exception of this rule.
    /// Force rules have no exceptions.
    pub fn is_exception(&self, canonical_value: &str) -> bool {
        !self.force && self.exceptions.contains(canonical_value)
    }
}

/// Read-only policy lookup table, built once per run.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    config: PolicyConfig,
    rules: HashMap<EntityType, PolicyRule>,
    mandatory: BTreeSet<Source>,
    canonicalizer: Canonicalizer,
    content_hash: String,
}

impl PolicyStore {
    /// Build a store from a parsed document, validating it.
    pub fn from_config(config: PolicyConfig) -> Result<Self> {
        if config.schema_version != POLICY_SCHEMA_VERSION {
            return Err(RedactionError::config(format!(
                "unsupported policy schema version {} (expected {})",
                config.schema_version, POLICY_SCHEMA_VERSION
            )));
        }

        let canonicalizer = Canonicalizer::new();
        let patterns = index_patterns(&config.patterns)?;

        let mut rules: HashMap<EntityType, PolicyRule> = HashMap::new();
        let mut covered: HashSet<&str> = HashSet::new();

        for def in &config.policies {
            for pattern_name in &def.patterns {
                let (pattern, entity_types) = patterns.get(pattern_name.as_str()).ok_or_else(|| {
                    RedactionError::config(format!(
                        "policy for {} references unknown pattern '{}'",
                        def.category, pattern_name
                    ))
                })?;
                covered.insert(pattern.name.as_str());

                for entity in entity_types {
                    let candidate = PolicyRule {
                        category: def.category,
                        sensitivity_level: def.sensitivity_level,
                        action: def.action,
                        matched_entity_types: entity_types.clone(),
                        force: def.force,
                        pattern: pattern.name.clone(),
                        exceptions: def
                            .exceptions
                            .iter()
                            .map(|v| canonicalizer.canonicalize(entity, v))
                            .collect(),
                    };
                    match rules.get(entity) {
                        None => {
                            rules.insert(entity.clone(), candidate);
                        }
                        Some(existing) => {
                            if existing.force && candidate.force && existing.action != candidate.action {
                                return Err(RedactionError::config(format!(
                                    "conflicting force rules for entity type {}: {} vs {}",
                                    entity, existing.action, candidate.action
                                )));
                            }
                            if outranks(&candidate, existing) {
                                rules.insert(entity.clone(), candidate);
                            }
                        }
                    }
                }
            }
        }

        for pattern in &config.patterns {
            if !covered.contains(pattern.name.as_str()) {
                warn!(pattern = %pattern.name, "pattern has no policy rule; its entities are retained");
            }
        }

        let mandatory = config.mandatory_sources.iter().copied().collect();
        let content_hash = hex::encode(Sha256::digest(serde_json::to_vec(&config)?));

        debug!(
            rules = rules.len(),
            patterns = config.patterns.len(),
            "policy store loaded"
        );

        Ok(Self {
            config,
            rules,
            mandatory,
            canonicalizer,
            content_hash,
        })
    }

    /// Store over the built-in policy document.
    pub fn builtin() -> Result<Self> {
        Self::from_config(PolicyConfig::default())
    }

    /// Parse and validate a JSON policy document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PolicyConfig = serde_json::from_str(json)
            .map_err(|e| RedactionError::config(format!("malformed policy: {}", e)))?;
        Self::from_config(config)
    }

    /// Load policy from a file. A missing or malformed file is a
    /// configuration error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RedactionError::config(format!("cannot read policy {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Save the underlying document to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Rule for an entity type, if any.
    pub fn rule_for(&self, entity_type: &EntityType) -> Option<&PolicyRule> {
        self.rules.get(entity_type)
    }

    /// Force rule for an entity type, if any.
    pub fn force_rule_for(&self, entity_type: &EntityType) -> Option<&PolicyRule> {
        self.rules.get(entity_type).filter(|r| r.force)
    }

    /// Action the policy assigns to a raw value of an entity type,
    /// including exceptions. Unmatched types are retained.
    pub fn action_for(&self, entity_type: &EntityType, value: &str) -> Action {
        match self.rules.get(entity_type) {
            Some(rule) if rule.is_exception(&self.canonicalizer.canonicalize(entity_type, value)) => {
                Action::Retain
            }
            Some(rule) => rule.action,
            None => Action::Retain,
        }
    }

    /// Whether a source is declared mandatory.
    pub fn is_mandatory(&self, source: Source) -> bool {
        self.mandatory.contains(&source)
    }

    /// Mandatory sources, sorted.
    pub fn mandatory_sources(&self) -> impl Iterator<Item = Source> + '_ {
        self.mandatory.iter().copied()
    }

    /// Entity types with a rule.
    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.rules.keys()
    }

    /// Canonicalizer used for exceptions and pseudonym keys.
    pub fn canonicalizer(&self) -> &Canonicalizer {
        &self.canonicalizer
    }

    /// SHA-256 of the serialized document, for report provenance.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// The underlying document.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

/// Higher-precedence rule for one entity type: force, then sensitivity.
/// Equal rank keeps the earlier declaration.
fn outranks(candidate: &PolicyRule, existing: &PolicyRule) -> bool {
    if candidate.force != existing.force {
        return candidate.force;
    }
    candidate.sensitivity_level > existing.sensitivity_level
}

/// Index patterns by name and resolve their entity types, rejecting
/// duplicates and entity types claimed by two patterns.
fn index_patterns(defs: &[PatternDef]) -> Result<HashMap<&str, (&PatternDef, Vec<EntityType>)>> {
    let mut by_name = HashMap::new();
    let mut owner: HashMap<EntityType, &str> = HashMap::new();

    for def in defs {
        let mut entity_types = vec![EntityType::new(&def.name)];
        for raw in &def.entities {
            let et = EntityType::new(raw);
            if !entity_types.contains(&et) {
                entity_types.push(et);
            }
        }

        for et in &entity_types {
            if let Some(other) = owner.insert(et.clone(), def.name.as_str()) {
                if other != def.name {
                    return Err(RedactionError::config(format!(
                        "entity type {} claimed by patterns '{}' and '{}'",
                        et, other, def.name
                    )));
                }
            }
        }

        if by_name.insert(def.name.as_str(), (def, entity_types)).is_some() {
            return Err(RedactionError::config(format!(
                "duplicate pattern name '{}'",
                def.name
            )));
        }
    }
    Ok(by_name)
}

impl Default for PolicyConfig {
    fn default() -> Self {
        fn pattern(name: &str, category: Category, entities: &[&str], description: &str) -> PatternDef {
            PatternDef {
                name: name.to_string(),
                category,
                entities: entities.iter().map(|s| s.to_string()).collect(),
                description: Some(description.to_string()),
            }
        }
        fn rule(
            category: Category,
            sensitivity_level: SensitivityLevel,
            action: Action,
            patterns: &[&str],
            force: bool,
        ) -> PolicyDef {
            PolicyDef {
                category,
                sensitivity_level,
                action,
                patterns: patterns.iter().map(|s| s.to_string()).collect(),
                force,
                exceptions: Vec::new(),
            }
        }

        use Category::*;
        use SensitivityLevel::*;

        let patterns = vec![
            pattern("email", Pii, &["EMAIL_ADDRESS"], "Email addresses"),
            pattern("phone", Pii, &["PHONE_NUMBER"], "Phone numbers"),
            pattern("person_name", Pii, &["PERSON"], "Person names"),
            pattern("credit_card", Pii, &["CARD"], "Credit card numbers"),
            pattern("ssn", Pii, &["US_SSN"], "Social Security Numbers"),
            pattern("address", Pii, &["LOCATION"], "Physical addresses"),
            pattern("hostname", OperationalIdentifiers, &["HOST"], "Server hostnames"),
            pattern("ip_address", OperationalIdentifiers, &["IP"], "IP addresses"),
            pattern("api_key", Secrets, &["SECRET", "TOKEN"], "API keys and secrets"),
            pattern("database_url", Secrets, &["CONNECTION_STRING"], "Database connection URLs"),
            pattern("company_name", CustomerOrgInfo, &["ORG", "ORGANIZATION"], "Company names"),
            pattern("customer_id", CustomerOrgInfo, &[], "Customer identifiers"),
            pattern("internal_path", Miscellaneous, &["PATH"], "Internal file/system paths"),
        ];

        let policies = vec![
            rule(Secrets, Critical, Action::Redact, &["api_key", "database_url"], true),
            rule(Pii, Critical, Action::Redact, &["ssn", "credit_card"], true),
            rule(Pii, High, Action::Redact, &["email", "phone"], true),
            rule(Pii, Medium, Action::Pseudonymize, &["person_name"], false),
            rule(
                OperationalIdentifiers,
                Medium,
                Action::Pseudonymize,
                &["hostname", "ip_address"],
                false,
            ),
            rule(
                CustomerOrgInfo,
                Low,
                Action::Pseudonymize,
                &["company_name", "customer_id"],
                false,
            ),
            rule(Pii, Low, Action::Retain, &["address"], false),
            rule(Miscellaneous, Minimum, Action::Retain, &["internal_path"], false),
        ];

        Self {
            schema_version: POLICY_SCHEMA_VERSION.to_string(),
            patterns,
            policies,
            mandatory_sources: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn et(s: &str) -> EntityType {
        EntityType::new(s)
    }

    #[test]
    fn test_default_policy_is_valid() {
        let store = PolicyStore::builtin().unwrap();
        assert!(store.force_rule_for(&et("EMAIL")).is_some());
        assert!(store.force_rule_for(&et("email_address")).is_some());
        assert_eq!(store.rule_for(&et("PERSON")).unwrap().action, Action::Pseudonymize);
        assert_eq!(
            store.rule_for(&et("PERSON_NAME")).unwrap().sensitivity_level,
            SensitivityLevel::Medium
        );
        assert_eq!(store.rule_for(&et("ADDRESS")).unwrap().action, Action::Retain);
        assert!(store.rule_for(&et("WEATHER")).is_none());
    }

    #[test]
    fn test_unknown_entity_is_retained() {
        let store = PolicyStore::builtin().unwrap();
        assert_eq!(store.action_for(&et("WEATHER"), "sunny"), Action::Retain);
    }

    #[test]
    fn test_exceptions_apply_to_non_force_rules_only() {
        let json = r#"{
            "patterns": [
                {"name": "email", "category": "PII"},
                {"name": "person_name", "category": "PII", "entities": ["PERSON"]}
            ],
            "policies": [
                {"category": "PII", "sensitivity_level": "HIGH", "action": "REDACT",
                 "patterns": ["email"], "force": true, "exceptions": ["support@company.com"]},
                {"category": "PII", "sensitivity_level": "MEDIUM", "action": "PSEUDONYMIZE",
                 "patterns": ["person_name"], "exceptions": ["Jane  Public"]}
            ]
        }"#;
        let store = PolicyStore::from_json(json).unwrap();
        assert_eq!(store.action_for(&et("EMAIL"), "support@company.com"), Action::Redact);
        assert_eq!(store.action_for(&et("PERSON"), "jane public"), Action::Retain);
        assert_eq!(store.action_for(&et("PERSON"), "John Doe"), Action::Pseudonymize);
    }

    #[test]
    fn test_unknown_pattern_is_configuration_error() {
        let json = r#"{
            "patterns": [],
            "policies": [{"category": "PII", "sensitivity_level": "HIGH", "action": "REDACT", "patterns": ["nope"]}]
        }"#;
        let err = PolicyStore::from_json(json).unwrap_err();
        assert!(matches!(err, RedactionError::ConfigurationError(_)));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_malformed_json_is_configuration_error() {
        let err = PolicyStore::from_json("{ not json").unwrap_err();
        assert!(matches!(err, RedactionError::ConfigurationError(_)));
        let err = PolicyStore::from_json(
            r#"{"policies": [{"category": "PII", "sensitivity_level": "EXTREME", "action": "REDACT"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RedactionError::ConfigurationError(_)));
    }

    #[test]
    fn test_duplicate_pattern_rejected() {
        let json = r#"{"patterns": [
            {"name": "email", "category": "PII"},
            {"name": "email", "category": "PII"}
        ]}"#;
        assert!(PolicyStore::from_json(json).is_err());
    }

    #[test]
    fn test_entity_claimed_twice_rejected() {
        let json = r#"{"patterns": [
            {"name": "email", "category": "PII", "entities": ["MAIL"]},
            {"name": "mailbox", "category": "PII", "entities": ["mail"]}
        ]}"#;
        let err = PolicyStore::from_json(json).unwrap_err();
        assert!(err.to_string().contains("MAIL"));
    }

    #[test]
    fn test_conflicting_force_rules_rejected() {
        let json = r#"{
            "patterns": [{"name": "email", "category": "PII"}],
            "policies": [
                {"category": "PII", "sensitivity_level": "HIGH", "action": "REDACT", "patterns": ["email"], "force": true},
                {"category": "PII", "sensitivity_level": "LOW", "action": "RETAIN", "patterns": ["email"], "force": true}
            ]
        }"#;
        assert!(PolicyStore::from_json(json).is_err());
    }

    #[test]
    fn test_rule_precedence() {
        let json = r#"{
            "patterns": [{"name": "hostname", "category": "OPERATIONAL_IDENTIFIERS"}],
            "policies": [
                {"category": "OPERATIONAL_IDENTIFIERS", "sensitivity_level": "LOW", "action": "RETAIN", "patterns": ["hostname"]},
                {"category": "OPERATIONAL_IDENTIFIERS", "sensitivity_level": "HIGH", "action": "PSEUDONYMIZE", "patterns": ["hostname"]}
            ]
        }"#;
        let store = PolicyStore::from_json(json).unwrap();
        let rule = store.rule_for(&et("hostname")).unwrap();
        assert_eq!(rule.action, Action::Pseudonymize);
        assert_eq!(rule.sensitivity_level, SensitivityLevel::High);
    }

    #[test]
    fn test_schema_version_checked() {
        let json = r#"{"schema_version": "9.9.9"}"#;
        assert!(PolicyStore::from_json(json).is_err());
    }

    #[test]
    fn test_mandatory_sources() {
        let json = r#"{"mandatory_sources": ["judge"]}"#;
        let store = PolicyStore::from_json(json).unwrap();
        assert!(store.is_mandatory(Source::Judge));
        assert!(!store.is_mandatory(Source::Finder));
    }

    #[test]
    fn test_load_and_save_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let store = PolicyStore::builtin().unwrap();
        store.save(&path).unwrap();
        let loaded = PolicyStore::load(&path).unwrap();
        assert_eq!(loaded.content_hash(), store.content_hash());
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = PolicyStore::load("/nonexistent/policy.json").unwrap_err();
        assert!(matches!(err, RedactionError::ConfigurationError(_)));
    }

    #[test]
    fn test_sensitivity_ordering() {
        assert!(SensitivityLevel::Critical > SensitivityLevel::High);
        assert!(SensitivityLevel::Low > SensitivityLevel::Minimum);
    }
}
