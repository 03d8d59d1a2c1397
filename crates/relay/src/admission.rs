//! Torrent admission policy.
//!
//! Applied to every kind-2003 event submitted to the relay server, in
//! order: explicit allow bypass, explicit blocks, structural checks,
//! then (when required) the curation verdict from the aggregator.

use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use tracing::warn;

use curation::aggregator::AggregationService;
use curation::decision::DecisionValue;
use protocol::event::{Event, TagName};
use shared::error::AppResult;
use shared::types::normalize_infohash;

/// Admission settings.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Pubkeys that bypass every other check
    pub allow_pubkeys: HashSet<String>,
    /// Pubkeys rejected outright
    pub block_pubkeys: HashSet<String>,
    /// Infohashes rejected outright
    pub block_infohashes: HashSet<String>,
    /// Require a well-formed infohash tag
    pub require_infohash: bool,
    /// Require an accepting curation verdict
    pub require_curation: bool,
    /// Maximum name length
    pub max_name_length: usize,
    /// Maximum content length
    pub max_content_length: usize,
    /// Names matching any of these patterns are rejected
    pub blocked_name_patterns: Vec<String>,
    /// When non-empty, at least one accepting curator must be local
    pub local_curators: HashSet<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            allow_pubkeys: HashSet::new(),
            block_pubkeys: HashSet::new(),
            block_infohashes: HashSet::new(),
            require_infohash: true,
            require_curation: false,
            max_name_length: 500,
            max_content_length: 10_000,
            blocked_name_patterns: Vec::new(),
            local_curators: HashSet::new(),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Allow,
    Deny(String),
}

impl AdmissionVerdict {
    /// Whether the event may be stored and broadcast.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// The denial reason, empty for allow.
    pub fn reason(&self) -> &str {
        match self {
            Self::Allow => "",
            Self::Deny(reason) => reason,
        }
    }
}

/// The compiled admission policy.
pub struct TorrentAdmissionPolicy {
    config: AdmissionConfig,
    blocked_patterns: Vec<Regex>,
}

impl TorrentAdmissionPolicy {
    /// Compile the policy. Invalid patterns are skipped with a warning.
    pub fn new(config: AdmissionConfig) -> Self {
        let blocked_patterns = config
            .blocked_name_patterns
            .iter()
            .filter_map(|pattern| {
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!("Skipping invalid blocked-name pattern {:?}: {}", pattern, e);
                        None
                    }
                }
            })
            .collect();

        Self {
            config,
            blocked_patterns,
        }
    }

    /// Run the admission checks for a torrent announcement.
    pub async fn check(
        &self,
        event: &Event,
        aggregation: &AggregationService,
    ) -> AppResult<AdmissionVerdict> {
        // 1. Explicit allow bypasses everything else.
        if self.config.allow_pubkeys.contains(&event.pubkey) {
            return Ok(AdmissionVerdict::Allow);
        }

        // 2. Explicit blocks.
        if self.config.block_pubkeys.contains(&event.pubkey) {
            return Ok(AdmissionVerdict::Deny("blocked: pubkey".to_string()));
        }

        let infohash = TagName::Infohash
            .value(event)
            .and_then(|raw| normalize_infohash(raw).ok());

        if let Some(infohash) = &infohash {
            if self.config.block_infohashes.contains(infohash) {
                return Ok(AdmissionVerdict::Deny("blocked: infohash".to_string()));
            }
        }

        // 3. Structural checks.
        if self.config.require_infohash && infohash.is_none() {
            return Ok(AdmissionVerdict::Deny(
                "invalid: missing infohash".to_string(),
            ));
        }

        let name = TagName::Name.value(event).unwrap_or_default();
        if name.trim().is_empty() {
            return Ok(AdmissionVerdict::Deny("invalid: missing name".to_string()));
        }
        if name.len() > self.config.max_name_length {
            return Ok(AdmissionVerdict::Deny("invalid: name too long".to_string()));
        }
        if event.content.len() > self.config.max_content_length {
            return Ok(AdmissionVerdict::Deny(
                "invalid: content too long".to_string(),
            ));
        }
        if self.blocked_patterns.iter().any(|p| p.is_match(name)) {
            return Ok(AdmissionVerdict::Deny("blocked: name".to_string()));
        }

        // 4. Curation verdict.
        if self.config.require_curation {
            let Some(infohash) = &infohash else {
                return Ok(AdmissionVerdict::Deny(
                    "invalid: missing infohash".to_string(),
                ));
            };

            let verdict = aggregation.verdict_for(infohash).await?;
            if verdict.total_curators == 0 {
                return Ok(AdmissionVerdict::Deny(
                    "no curation decision found".to_string(),
                ));
            }
            if verdict.decision != DecisionValue::Accept {
                let reason = verdict
                    .primary_reason
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "rejected".to_string());
                return Ok(AdmissionVerdict::Deny(format!(
                    "curation rejected: {}",
                    reason
                )));
            }
            if !self.config.local_curators.is_empty()
                && !verdict
                    .accepting_curators
                    .iter()
                    .any(|curator| self.config.local_curators.contains(curator))
            {
                return Ok(AdmissionVerdict::Deny(
                    "no decision from local curators".to_string(),
                ));
            }
        }

        Ok(AdmissionVerdict::Allow)
    }
}
