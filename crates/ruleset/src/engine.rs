//! Rule evaluation engine.
//!
//! Holds at most one active ruleset per type. Evaluation iterates rules in
//! declaration order; compiled regexes and normalized value sets are
//! memoized per rule id and dropped when a ruleset is replaced.

use regex::{Regex, RegexBuilder};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::warn;

use torrent::record::TorrentRecord;
use torrent::score::metadata_score_for_fields;

use crate::model::{Rule, RuleAction, RuleCondition, RuleType, Ruleset, RulesetType};
use crate::reason::ReasonCode;

/// Semantic score at or above which a record is rejected unless a rule
/// already decided otherwise.
pub const DEFAULT_SEMANTIC_REJECT_THRESHOLD: f64 = 0.7;

/// One rule that matched during evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRule {
    pub rule_id: String,
    pub code: ReasonCode,
    pub action: RuleAction,
    pub score: f64,
}

/// Outcome of evaluating one ruleset against one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationResult {
    /// False when the ruleset itself decided to reject
    pub passed: bool,
    /// Rules that matched, in declaration order
    pub matched_rules: Vec<MatchedRule>,
    /// Mean score of matched rules; 0 when none matched
    pub score: f64,
}

impl EvaluationResult {
    /// Fresh passing result.
    pub fn passing() -> Self {
        Self {
            passed: true,
            matched_rules: Vec::new(),
            score: 0.0,
        }
    }

    /// Reason codes of matched reject rules, deduplicated in order.
    pub fn reject_codes(&self) -> Vec<ReasonCode> {
        let mut seen = HashSet::new();
        self.matched_rules
            .iter()
            .filter(|m| m.action == RuleAction::Reject)
            .filter(|m| seen.insert(m.code))
            .map(|m| m.code)
            .collect()
    }

    /// All matched reason codes, deduplicated in order.
    pub fn all_codes(&self) -> Vec<ReasonCode> {
        let mut seen = HashSet::new();
        self.matched_rules
            .iter()
            .filter(|m| seen.insert(m.code))
            .map(|m| m.code)
            .collect()
    }

    fn push_match(&mut self, rule: &Rule, score: f64) {
        self.matched_rules.push(MatchedRule {
            rule_id: rule.id.clone(),
            code: rule.code,
            action: rule.action,
            score,
        });
    }

    fn finish_score(&mut self) {
        if self.matched_rules.is_empty() {
            self.score = 0.0;
        } else {
            self.score = self.matched_rules.iter().map(|m| m.score).sum::<f64>()
                / self.matched_rules.len() as f64;
        }
    }
}

/// The evaluation engine. One active ruleset per type; caches keyed by
/// rule id behind a reader/writer lock.
pub struct RuleEngine {
    censoring: RwLock<Option<Ruleset>>,
    semantic: RwLock<Option<Ruleset>>,
    // None records a pattern that failed to compile; the rule never matches.
    regex_cache: RwLock<HashMap<String, Option<Regex>>>,
    set_cache: RwLock<HashMap<String, HashSet<String>>>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// New engine with no rulesets loaded.
    pub fn new() -> Self {
        Self {
            censoring: RwLock::new(None),
            semantic: RwLock::new(None),
            regex_cache: RwLock::new(HashMap::new()),
            set_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the active censoring ruleset and clear caches.
    pub fn set_censoring(&self, ruleset: Option<Ruleset>) {
        *self.censoring.write().unwrap() = ruleset;
        self.clear_caches();
    }

    /// Replace the active semantic ruleset and clear caches.
    pub fn set_semantic(&self, ruleset: Option<Ruleset>) {
        *self.semantic.write().unwrap() = ruleset;
        self.clear_caches();
    }

    /// Currently active ruleset of the given type.
    pub fn active(&self, ruleset_type: RulesetType) -> Option<Ruleset> {
        match ruleset_type {
            RulesetType::Censoring => self.censoring.read().unwrap().clone(),
            RulesetType::Semantic => self.semantic.read().unwrap().clone(),
        }
    }

    fn clear_caches(&self) {
        self.regex_cache.write().unwrap().clear();
        self.set_cache.write().unwrap().clear();
    }

    /// Evaluate the censoring ruleset: any reject match fails the record.
    pub fn evaluate_censoring(&self, record: &TorrentRecord) -> EvaluationResult {
        let guard = self.censoring.read().unwrap();
        let mut result = EvaluationResult::passing();

        if let Some(ruleset) = guard.as_ref() {
            for rule in ruleset.rules.iter().filter(|r| r.enabled) {
                if let Some(score) = self.evaluate_condition(rule, record) {
                    result.push_match(rule, score);
                    if rule.action == RuleAction::Reject {
                        result.passed = false;
                    }
                }
            }
        }

        result.finish_score();
        result
    }

    /// Evaluate the semantic ruleset: only a deterministic reject match
    /// fails the record outright; otherwise the caller compares the score
    /// to its threshold.
    pub fn evaluate_semantic(&self, record: &TorrentRecord) -> EvaluationResult {
        let guard = self.semantic.read().unwrap();
        let mut result = EvaluationResult::passing();

        if let Some(ruleset) = guard.as_ref() {
            for rule in ruleset.rules.iter().filter(|r| r.enabled) {
                if let Some(score) = self.evaluate_condition(rule, record) {
                    result.push_match(rule, score);
                    if rule.action == RuleAction::Reject && rule.rule_type == RuleType::Deterministic
                    {
                        result.passed = false;
                    }
                }
            }
        }

        result.finish_score();
        result
    }

    /// Fold both evaluations into a final verdict.
    ///
    /// Censoring reject matches win outright; then semantic reject matches;
    /// then the aggregate semantic score against the threshold.
    pub fn should_reject(
        censoring: &EvaluationResult,
        semantic: &EvaluationResult,
        threshold: f64,
    ) -> (bool, Vec<ReasonCode>) {
        let censoring_rejects = censoring.reject_codes();
        if !censoring_rejects.is_empty() {
            return (true, censoring_rejects);
        }

        let semantic_rejects = semantic.reject_codes();
        if !semantic_rejects.is_empty() {
            return (true, semantic_rejects);
        }

        if semantic.score >= threshold && !semantic.matched_rules.is_empty() {
            return (true, semantic.all_codes());
        }

        (false, Vec::new())
    }

    /// Evaluate one rule's condition. Returns the match score, or None for
    /// no match.
    fn evaluate_condition(&self, rule: &Rule, record: &TorrentRecord) -> Option<f64> {
        match &rule.condition {
            RuleCondition::InfohashList { infohashes } => {
                let set = self.normalized_set(&rule.id, infohashes);
                set.contains(&record.infohash).then_some(1.0)
            }
            RuleCondition::PubkeyList { pubkeys } => {
                let set = self.normalized_set(&rule.id, pubkeys);
                set.contains(&record.uploader.to_lowercase()).then_some(1.0)
            }
            RuleCondition::Regex { field, pattern } => {
                let value = field_value(record, field)?;
                let regex = self.compiled_regex(&rule.id, pattern)?;
                regex.is_match(&value).then_some(1.0)
            }
            RuleCondition::MetadataScore {
                required_fields,
                min_score,
            } => {
                let score = metadata_score_for_fields(record, required_fields);
                (score < *min_score).then_some(1.0 - score)
            }
            RuleCondition::SizeRange {
                min_bytes,
                max_bytes,
            } => {
                let above = min_bytes.map_or(true, |min| record.size >= min);
                let below = max_bytes.map_or(true, |max| record.size <= max);
                (above && below).then_some(1.0)
            }
            RuleCondition::CategoryMatch { categories } => record
                .category
                .is_some_and(|c| categories.contains(&c))
                .then_some(1.0),
            RuleCondition::TagMatch { required_tags } => {
                if required_tags.is_empty() {
                    return None;
                }
                let required: HashSet<String> =
                    required_tags.iter().map(|t| t.to_lowercase()).collect();
                let overlap = record
                    .labels
                    .iter()
                    .filter(|l| required.contains(l.as_str()))
                    .count();
                if overlap == 0 {
                    return None;
                }
                Some(overlap as f64 / required.len() as f64)
            }
        }
    }

    fn normalized_set(&self, rule_id: &str, values: &[String]) -> HashSet<String> {
        if let Some(cached) = self.set_cache.read().unwrap().get(rule_id) {
            return cached.clone();
        }

        let set: HashSet<String> = values.iter().map(|v| v.to_lowercase()).collect();
        self.set_cache
            .write()
            .unwrap()
            .insert(rule_id.to_string(), set.clone());
        set
    }

    fn compiled_regex(&self, rule_id: &str, pattern: &str) -> Option<Regex> {
        if let Some(cached) = self.regex_cache.read().unwrap().get(rule_id) {
            return cached.clone();
        }

        let compiled = match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Rule {} has an invalid pattern, never matches: {}", rule_id, e);
                None
            }
        };

        self.regex_cache
            .write()
            .unwrap()
            .insert(rule_id.to_string(), compiled.clone());
        compiled
    }
}

/// String value of a record field for regex matching, case-normalized.
fn field_value(record: &TorrentRecord, field: &str) -> Option<String> {
    match field {
        "name" => Some(record.name.to_lowercase()),
        "title" => record.title.as_ref().map(|t| t.to_lowercase()),
        "overview" => record.overview.as_ref().map(|o| o.to_lowercase()),
        "infohash" => Some(record.infohash.clone()),
        "uploader" => Some(record.uploader.to_lowercase()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Rule, RuleAction, RuleCondition, RuleType, Ruleset, RulesetType};

    fn record() -> TorrentRecord {
        TorrentRecord {
            infohash: "b".repeat(40),
            name: "Great Movie 2024 CAMRip".to_string(),
            title: None,
            size: 700 * 1024 * 1024,
            category: Some(2000),
            labels: vec!["cam".to_string(), "movie".to_string()],
            files: vec![],
            uploader: "c".repeat(64),
            external_ids: vec!["imdb:tt1".to_string()],
            year: Some(2024),
            overview: None,
            event_id: "e".repeat(64),
        }
    }

    fn rule(id: &str, code: ReasonCode, action: RuleAction, condition: RuleCondition) -> Rule {
        Rule {
            id: id.to_string(),
            code,
            rule_type: if code.is_deterministic() {
                RuleType::Deterministic
            } else {
                RuleType::Probabilistic
            },
            action,
            enabled: true,
            priority: 1,
            condition,
        }
    }

    fn ruleset(ruleset_type: RulesetType, rules: Vec<Rule>) -> Ruleset {
        let mut ruleset = Ruleset {
            id: format!("rs-{}", ruleset_type),
            name: "test".to_string(),
            ruleset_type,
            version: "1".to_string(),
            hash: String::new(),
            rules,
            created_at: 1_700_000_000,
            deprecated_at: None,
        };
        ruleset.seal().unwrap();
        ruleset
    }

    #[test]
    fn test_censoring_infohash_block_short_circuits_semantic() {
        let engine = RuleEngine::new();
        engine.set_censoring(Some(ruleset(
            RulesetType::Censoring,
            vec![rule(
                "block-bbbb",
                ReasonCode::AbuseMalware,
                RuleAction::Reject,
                RuleCondition::InfohashList {
                    infohashes: vec!["b".repeat(40)],
                },
            )],
        )));

        let censoring = engine.evaluate_censoring(&record());
        let semantic = engine.evaluate_semantic(&record());

        assert!(!censoring.passed);
        assert!(semantic.passed);

        let (reject, reasons) = RuleEngine::should_reject(
            &censoring,
            &semantic,
            DEFAULT_SEMANTIC_REJECT_THRESHOLD,
        );
        assert!(reject);
        assert_eq!(reasons, vec![ReasonCode::AbuseMalware]);
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let engine = RuleEngine::new();
        let mut blocked = rule(
            "block-bbbb",
            ReasonCode::AbuseMalware,
            RuleAction::Reject,
            RuleCondition::InfohashList {
                infohashes: vec!["b".repeat(40)],
            },
        );
        blocked.enabled = false;
        engine.set_censoring(Some(ruleset(RulesetType::Censoring, vec![blocked])));

        let result = engine.evaluate_censoring(&record());
        assert!(result.passed);
        assert!(result.matched_rules.is_empty());
    }

    #[test]
    fn test_regex_condition_is_case_insensitive() {
        let engine = RuleEngine::new();
        engine.set_semantic(Some(ruleset(
            RulesetType::Semantic,
            vec![rule(
                "camrip",
                ReasonCode::SemLowQuality,
                RuleAction::Reject,
                RuleCondition::Regex {
                    field: "name".to_string(),
                    pattern: "cam.?rip".to_string(),
                },
            )],
        )));

        let result = engine.evaluate_semantic(&record());
        assert_eq!(result.matched_rules.len(), 1);
        // Probabilistic reject does not flip `passed`.
        assert!(result.passed);
        assert!((result.score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_regex_never_matches() {
        let engine = RuleEngine::new();
        engine.set_semantic(Some(ruleset(
            RulesetType::Semantic,
            vec![rule(
                "broken",
                ReasonCode::SemLowQuality,
                RuleAction::Reject,
                RuleCondition::Regex {
                    field: "name".to_string(),
                    pattern: "([unclosed".to_string(),
                },
            )],
        )));

        let result = engine.evaluate_semantic(&record());
        assert!(result.passed);
        assert!(result.matched_rules.is_empty());
    }

    #[test]
    fn test_deterministic_semantic_reject_fails_record() {
        let engine = RuleEngine::new();
        engine.set_semantic(Some(ruleset(
            RulesetType::Semantic,
            vec![rule(
                "exact-dup",
                ReasonCode::SemDuplicateExact,
                RuleAction::Reject,
                RuleCondition::InfohashList {
                    infohashes: vec!["b".repeat(40)],
                },
            )],
        )));

        let result = engine.evaluate_semantic(&record());
        assert!(!result.passed);
    }

    #[test]
    fn test_semantic_threshold_rejects() {
        let engine = RuleEngine::new();
        engine.set_semantic(Some(ruleset(
            RulesetType::Semantic,
            vec![rule(
                "cam-label",
                ReasonCode::SemLowQuality,
                RuleAction::Accept,
                RuleCondition::TagMatch {
                    required_tags: vec!["cam".to_string()],
                },
            )],
        )));

        let semantic = engine.evaluate_semantic(&record());
        assert!(semantic.passed);
        assert!((semantic.score - 1.0).abs() < f64::EPSILON);

        let censoring = EvaluationResult::passing();
        let (reject, reasons) = RuleEngine::should_reject(&censoring, &semantic, 0.7);
        assert!(reject);
        assert_eq!(reasons, vec![ReasonCode::SemLowQuality]);

        let (reject, _) = RuleEngine::should_reject(&censoring, &semantic, 1.1);
        assert!(!reject);
    }

    #[test]
    fn test_metadata_score_condition() {
        let engine = RuleEngine::new();
        engine.set_semantic(Some(ruleset(
            RulesetType::Semantic,
            vec![rule(
                "needs-files",
                ReasonCode::SemBadMeta,
                RuleAction::Reject,
                RuleCondition::MetadataScore {
                    required_fields: vec!["files".to_string(), "overview".to_string()],
                    min_score: 0.5,
                },
            )],
        )));

        // The record has neither files nor overview: score 0, match at 1.0.
        let result = engine.evaluate_semantic(&record());
        assert_eq!(result.matched_rules.len(), 1);
        assert!((result.matched_rules[0].score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_size_and_category_conditions() {
        let engine = RuleEngine::new();
        engine.set_censoring(Some(ruleset(
            RulesetType::Censoring,
            vec![
                rule(
                    "tiny",
                    ReasonCode::SemFake,
                    RuleAction::Reject,
                    RuleCondition::SizeRange {
                        min_bytes: None,
                        max_bytes: Some(1024),
                    },
                ),
                rule(
                    "category",
                    ReasonCode::SemWrongCategory,
                    RuleAction::Reject,
                    RuleCondition::CategoryMatch {
                        categories: vec![2000],
                    },
                ),
            ],
        )));

        let result = engine.evaluate_censoring(&record());
        // Size is above the max; only the category rule matches.
        assert_eq!(result.matched_rules.len(), 1);
        assert_eq!(result.matched_rules[0].code, ReasonCode::SemWrongCategory);
    }

    #[test]
    fn test_set_clears_caches() {
        let engine = RuleEngine::new();
        engine.set_censoring(Some(ruleset(
            RulesetType::Censoring,
            vec![rule(
                "r1",
                ReasonCode::AbuseMalware,
                RuleAction::Reject,
                RuleCondition::InfohashList {
                    infohashes: vec!["b".repeat(40)],
                },
            )],
        )));
        assert!(!engine.evaluate_censoring(&record()).passed);

        // Same rule id, different list. A stale set cache would still match.
        engine.set_censoring(Some(ruleset(
            RulesetType::Censoring,
            vec![rule(
                "r1",
                ReasonCode::AbuseMalware,
                RuleAction::Reject,
                RuleCondition::InfohashList {
                    infohashes: vec!["d".repeat(40)],
                },
            )],
        )));
        assert!(engine.evaluate_censoring(&record()).passed);
    }
}
