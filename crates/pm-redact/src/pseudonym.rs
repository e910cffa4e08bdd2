//! Run-scoped pseudonym registry.
//!
//! Tokens look like `Person_3fa9c2d1`: a readable prefix derived from the
//! entity type and the leading hex digits of HMAC-SHA256(run key,
//! entity type NUL canonical value). One registry is shared by every
//! incident of a batch, so a value keeps its token across incidents.
//!
//! All lookups and insertions go through a single mutex around an arena of
//! entries plus two indexes (by value and by token).

use crate::canonicalize::Canonicalizer;
use crate::error::{RedactionError, Result};
use crate::hash::KeyMaterial;
use crate::span::EntityType;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{trace, warn};

/// Hex digits in a fresh token id.
pub const TOKEN_ID_HEX_LEN: usize = 8;

/// Hex digits added per collision step.
const COLLISION_EXTENSION: usize = 2;

static RE_TOKEN_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]*_[0-9a-f]{8,64}$").unwrap());

static RE_MARKER_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[REDACTED_[A-Z0-9_]+\]$").unwrap());

/// One issued pseudonym.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PseudonymEntry {
    pub entity_type: EntityType,
    pub canonical_original_value: String,
    pub assigned_token: String,
}

/// Pseudonym mapping as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub token: String,
    pub entity_type: EntityType,
    /// Canonical original value; present only when explicitly requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_value: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: Vec<PseudonymEntry>,
    by_value: HashMap<(EntityType, String), usize>,
    by_token: HashMap<String, usize>,
}

/// Thread-safe registry of issued tokens for one processing run.
#[derive(Debug)]
pub struct PseudonymRegistry {
    key: KeyMaterial,
    canonicalizer: Canonicalizer,
    inner: Mutex<RegistryInner>,
}

impl PseudonymRegistry {
    /// Registry keyed with the given run key.
    pub fn new(key: KeyMaterial) -> Self {
        Self {
            key,
            canonicalizer: Canonicalizer::new(),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Identifier of the run key.
    pub fn key_id(&self) -> &str {
        &self.key.key_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryInner>> {
        self.inner.lock().map_err(|_| {
            warn!("pseudonym registry lock poisoned");
            RedactionError::internal()
        })
    }

    /// Token for a raw value, issuing one on first sight.
    pub fn token_for(&self, entity_type: &EntityType, raw_value: &str) -> Result<String> {
        let canonical = self.canonicalizer.canonicalize(entity_type, raw_value);
        let value_key = (entity_type.clone(), canonical);

        let mut inner = self.lock()?;
        if let Some(&idx) = inner.by_value.get(&value_key) {
            return Ok(inner.entries[idx].assigned_token.clone());
        }

        let digest = self.key.digest_hex(&[entity_type.as_str(), &value_key.1])?;
        let prefix = token_prefix(entity_type);
        let mut id_len = TOKEN_ID_HEX_LEN;
        let token = loop {
            let candidate = format!("{}_{}", prefix, &digest[..id_len]);
            if !inner.by_token.contains_key(&candidate) {
                break candidate;
            }
            id_len += COLLISION_EXTENSION;
            if id_len > digest.len() {
                return Err(RedactionError::internal());
            }
            trace!(entity_type = %entity_type, id_len, "pseudonym collision, extending id");
        };

        let idx = inner.entries.len();
        inner.entries.push(PseudonymEntry {
            entity_type: value_key.0.clone(),
            canonical_original_value: value_key.1.clone(),
            assigned_token: token.clone(),
        });
        inner.by_token.insert(token.clone(), idx);
        inner.by_value.insert(value_key, idx);
        Ok(token)
    }

    /// Token previously issued for a raw value, if any.
    pub fn lookup(&self, entity_type: &EntityType, raw_value: &str) -> Result<Option<String>> {
        let canonical = self.canonicalizer.canonicalize(entity_type, raw_value);
        let inner = self.lock()?;
        Ok(inner
            .by_value
            .get(&(entity_type.clone(), canonical))
            .map(|&idx| inner.entries[idx].assigned_token.clone()))
    }

    /// Whether `text` is a token this registry issued.
    pub fn is_issued_token(&self, text: &str) -> Result<bool> {
        Ok(self.lock()?.by_token.contains_key(text))
    }

    /// Number of issued tokens.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of all entries in issue order.
    pub fn entries(&self) -> Result<Vec<PseudonymEntry>> {
        Ok(self.lock()?.entries.clone())
    }

    /// Mapping records for the given tokens (all tokens when `None`),
    /// sorted by token.
    pub fn mapping(&self, tokens: Option<&[String]>, include_original: bool) -> Result<Vec<MappingRecord>> {
        let inner = self.lock()?;
        let mut out: Vec<MappingRecord> = match tokens {
            Some(tokens) => tokens
                .iter()
                .filter_map(|t| inner.by_token.get(t).map(|&i| &inner.entries[i]))
                .map(|e| to_record(e, include_original))
                .collect(),
            None => inner
                .entries
                .iter()
                .map(|e| to_record(e, include_original))
                .collect(),
        };
        out.sort_by(|a, b| a.token.cmp(&b.token));
        out.dedup_by(|a, b| a.token == b.token);
        Ok(out)
    }
}

fn to_record(entry: &PseudonymEntry, include_original: bool) -> MappingRecord {
    MappingRecord {
        token: entry.assigned_token.clone(),
        entity_type: entry.entity_type.clone(),
        original_value: include_original.then(|| entry.canonical_original_value.clone()),
    }
}

/// Readable token prefix for an entity type.
pub fn token_prefix(entity_type: &EntityType) -> String {
    match entity_type.as_str() {
        "PERSON" | "PERSON_NAME" => "Person".to_string(),
        "ORG" | "ORGANIZATION" | "COMPANY_NAME" => "Org".to_string(),
        "HOST" | "HOSTNAME" => "Host".to_string(),
        "IP" | "IP_ADDRESS" => "Ip".to_string(),
        "EMAIL" | "EMAIL_ADDRESS" => "Email".to_string(),
        "PHONE" | "PHONE_NUMBER" => "Phone".to_string(),
        "CUSTOMER_ID" => "Customer".to_string(),
        other => other
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                    None => String::new(),
                }
            })
            .collect(),
    }
}

/// Whether `text` has the shape of a pseudonym token.
pub fn looks_like_token(text: &str) -> bool {
    RE_TOKEN_SHAPE.is_match(text)
}

/// Whether `text` is a redaction marker.
pub fn looks_like_marker(text: &str) -> bool {
    RE_MARKER_SHAPE.is_match(text)
}
