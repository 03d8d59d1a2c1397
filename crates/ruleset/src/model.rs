//! Ruleset and rule definitions.
//!
//! A ruleset is versioned twice: by a human-chosen version string and by a
//! content-addressed SHA-256 hash computed over its JSON form with `hash`,
//! `created_at`, and `deprecated_at` cleared. The hash is stable under
//! re-serialization of the same logical content.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use shared::error::ValidationError;

use crate::reason::ReasonCode;

/// Which evaluation pipeline a ruleset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesetType {
    /// Deterministic block rules; any reject match fails the record
    Censoring,
    /// Probabilistic quality rules; scores accumulate toward a threshold
    Semantic,
}

impl std::fmt::Display for RulesetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Censoring => write!(f, "censoring"),
            Self::Semantic => write!(f, "semantic"),
        }
    }
}

/// How a single rule's match is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Deterministic,
    Probabilistic,
}

/// What a matching rule means for the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Reject,
}

/// Rule matching condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Exact infohash membership
    InfohashList { infohashes: Vec<String> },

    /// Uploader pubkey membership
    PubkeyList { pubkeys: Vec<String> },

    /// Case-insensitive regex over a named record field
    Regex { field: String, pattern: String },

    /// Weighted metadata completeness below a threshold
    MetadataScore {
        required_fields: Vec<String>,
        min_score: f64,
    },

    /// Payload size window in bytes
    SizeRange {
        min_bytes: Option<u64>,
        max_bytes: Option<u64>,
    },

    /// Torznab category membership
    CategoryMatch { categories: Vec<u32> },

    /// Required label overlap; match score is |intersection| / |required|
    TagMatch { required_tags: Vec<String> },
}

/// A single rule inside a ruleset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule id, unique within the ruleset
    pub id: String,

    /// Reason code attached to a match
    pub code: ReasonCode,

    /// Deterministic or probabilistic classification
    #[serde(rename = "type")]
    pub rule_type: RuleType,

    /// Effect of a match
    pub action: RuleAction,

    /// Disabled rules are skipped during evaluation
    pub enabled: bool,

    /// Display/priority hint; evaluation order is declaration order
    pub priority: i32,

    /// Matching condition
    pub condition: RuleCondition,
}

/// A versioned, content-addressed collection of rules of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    /// Ruleset id
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Ruleset type
    #[serde(rename = "type")]
    pub ruleset_type: RulesetType,

    /// Version string
    pub version: String,

    /// Content-addressed hash (hex SHA-256)
    pub hash: String,

    /// Ordered rules
    pub rules: Vec<Rule>,

    /// Creation time, unix seconds
    pub created_at: i64,

    /// Deprecation time; deprecation is irreversible
    pub deprecated_at: Option<i64>,
}

impl Ruleset {
    /// Compute the content hash: SHA-256 over the JSON serialization with
    /// `hash`, `created_at`, and `deprecated_at` cleared.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut cleared = self.clone();
        cleared.hash = String::new();
        cleared.created_at = 0;
        cleared.deprecated_at = None;

        let canonical = serde_json::to_string(&cleared)?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// Fill in the content hash.
    pub fn seal(&mut self) -> Result<(), serde_json::Error> {
        self.hash = self.compute_hash()?;
        Ok(())
    }

    /// Whether the ruleset has been deprecated.
    pub fn is_deprecated(&self) -> bool {
        self.deprecated_at.is_some()
    }

    /// Validate structure and, when a hash is present, its integrity.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(ValidationError::MissingField("version".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(ValidationError::MissingField("rule.id".to_string()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(ValidationError::InvalidField {
                    field: "rules".to_string(),
                    message: format!("duplicate rule id: {}", rule.id),
                });
            }
            if let RuleCondition::MetadataScore { min_score, .. } = &rule.condition {
                if !(0.0..=1.0).contains(min_score) {
                    return Err(ValidationError::OutOfRange(format!(
                        "metadata_score min_score {} not in 0..1",
                        min_score
                    )));
                }
            }
        }

        if !self.hash.is_empty() {
            let computed = self.compute_hash().map_err(|e| {
                ValidationError::InvalidFormat(format!("hash computation failed: {}", e))
            })?;
            if computed != self.hash {
                return Err(ValidationError::InvalidField {
                    field: "hash".to_string(),
                    message: "content hash mismatch".to_string(),
                });
            }
        }

        Ok(())
    }
}
