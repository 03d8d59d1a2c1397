//! Decision aggregation.
//!
//! The aggregator folds every stored decision on one infohash into a single
//! verdict under the instance's trust policy and aggregation mode. Inputs
//! from unapproved curators, decisions that fail verification, and
//! decisions tied to unapproved ruleset hashes are dropped silently, so
//! the output is a pure function of the valid input set.
//!
//! Note on defaults: the quorum and weighted modes default to *accept*
//! when neither side reaches its threshold. Operators who need the inverse
//! default should run mode `all`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::RwLock;

use ruleset::reason::ReasonCode;
use ruleset::store::RulesetStore;
use shared::error::AppResult;
use shared::types::now_ts;

use crate::decision::{DecisionValue, VerificationDecision};
use crate::decision_store::DecisionStore;
use crate::trust::TrustPolicy;
use crate::trust_store::TrustPolicyStore;

/// How many curators' accepts are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// One accepting curator suffices
    Any,
    /// A single reject blocks
    All,
    /// A configurable number of curators must agree
    Quorum,
    /// Curator weights from the trust policy must clear a threshold
    Weighted,
}

/// In-memory aggregation settings. Not signed, not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationPolicy {
    pub mode: AggregationMode,

    /// Accepting-curator count needed in quorum mode; defaults to a simple
    /// majority of the voting curators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum_required: Option<usize>,

    /// Weight needed in weighted mode; defaults to half the total weight
    /// plus one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_threshold: Option<f64>,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            mode: AggregationMode::Quorum,
            quorum_required: None,
            weight_threshold: None,
        }
    }
}

/// The folded verdict for one infohash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedDecision {
    /// Final verdict
    pub decision: DecisionValue,

    /// Confidence in the verdict, 0..1
    pub confidence: f64,

    /// Number of curators that voted
    pub total_curators: usize,

    /// Curators that accepted
    pub accepting_curators: Vec<String>,

    /// Curators that rejected
    pub rejecting_curators: Vec<String>,

    /// Strongest rejection reason, when rejecting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_reason: Option<ReasonCode>,

    /// Every rejection reason seen
    #[serde(default)]
    pub all_reasons: Vec<ReasonCode>,

    /// Decision ids that survived filtering
    #[serde(default)]
    pub source_decisions: Vec<String>,

    /// When the aggregation ran, unix seconds
    pub aggregated_at: i64,
}

impl AggregatedDecision {
    fn empty() -> Self {
        Self {
            decision: DecisionValue::Accept,
            confidence: 0.0,
            total_curators: 0,
            accepting_curators: Vec::new(),
            rejecting_curators: Vec::new(),
            primary_reason: None,
            all_reasons: Vec::new(),
            source_decisions: Vec::new(),
            aggregated_at: now_ts(),
        }
    }
}

/// Fold a bag of decisions on `infohash` into one verdict.
///
/// `approved_hashes` is the instance-wide set of known, non-deprecated
/// ruleset hashes; a decision carrying a hash outside it is dropped.
pub fn aggregate(
    infohash: &str,
    decisions: &[VerificationDecision],
    policy: Option<&TrustPolicy>,
    approved_hashes: &HashSet<String>,
    aggregation: &AggregationPolicy,
) -> AggregatedDecision {
    // Filtering pass: approved curator, verifying signature, approved hash.
    let valid: Vec<&VerificationDecision> = decisions
        .iter()
        .filter(|d| d.target_infohash == infohash)
        .filter(|d| policy.is_some_and(|p| p.is_approved(&d.curator_pubkey)))
        .filter(|d| d.validate().is_ok() && d.verify().is_ok())
        .filter(|d| {
            d.ruleset_hash
                .as_ref()
                .map_or(true, |h| approved_hashes.contains(h))
        })
        .collect();

    if valid.is_empty() {
        // No information: accept with zero confidence.
        return AggregatedDecision::empty();
    }

    let mut result = AggregatedDecision::empty();
    result.source_decisions = valid.iter().map(|d| d.decision_id.clone()).collect();

    let mut accepting: Vec<String> = Vec::new();
    let mut rejecting: Vec<String> = Vec::new();
    for d in &valid {
        let side = match d.decision {
            DecisionValue::Accept => &mut accepting,
            DecisionValue::Reject => &mut rejecting,
        };
        if !side.contains(&d.curator_pubkey) {
            side.push(d.curator_pubkey.clone());
        }
    }

    let accept_count = accepting.len();
    let reject_count = rejecting.len();
    let total = accept_count + reject_count;

    result.total_curators = total;
    result.accepting_curators = accepting;
    result.rejecting_curators = rejecting;

    let mut all_reasons: Vec<ReasonCode> = Vec::new();
    for d in valid.iter().filter(|d| d.decision == DecisionValue::Reject) {
        for code in &d.reason_codes {
            if !all_reasons.contains(code) {
                all_reasons.push(*code);
            }
        }
    }
    result.all_reasons = all_reasons;

    // Legal override: a single legal reject wins unconditionally.
    let mut legal: Option<(&VerificationDecision, ReasonCode)> = None;
    for d in valid.iter().filter(|d| d.decision == DecisionValue::Reject) {
        let legal_codes: Vec<ReasonCode> = d
            .reason_codes
            .iter()
            .copied()
            .filter(ReasonCode::is_legal)
            .collect();
        if let Some(code) = ReasonCode::strongest(&legal_codes) {
            // Ties keep the earliest decision.
            if legal.map_or(true, |(_, best)| code.priority() > best.priority()) {
                legal = Some((*d, code));
            }
        }
    }

    if let Some((decision, code)) = legal {
        result.decision = DecisionValue::Reject;
        result.confidence = 1.0;
        result.primary_reason = Some(code);
        result.rejecting_curators = vec![decision.curator_pubkey.clone()];
        return result;
    }

    let (verdict, confidence) = match aggregation.mode {
        AggregationMode::Any => {
            if accept_count >= 1 {
                (DecisionValue::Accept, ratio(accept_count, total))
            } else {
                (DecisionValue::Reject, ratio(reject_count, total))
            }
        }
        AggregationMode::All => {
            if reject_count == 0 {
                (DecisionValue::Accept, 1.0)
            } else {
                (DecisionValue::Reject, ratio(reject_count, total))
            }
        }
        AggregationMode::Quorum => {
            let majority = total / 2 + 1;
            let quorum = aggregation.quorum_required.unwrap_or(majority);
            if accept_count >= quorum {
                (DecisionValue::Accept, ratio(accept_count, total))
            } else if reject_count >= majority {
                // Rejection clears at a simple majority even when the
                // configured quorum is higher.
                (DecisionValue::Reject, ratio(reject_count, total))
            } else {
                (
                    DecisionValue::Accept,
                    ratio(accept_count, quorum).min(1.0),
                )
            }
        }
        AggregationMode::Weighted => {
            let weight_of = |pubkey: &String| {
                policy.map(|p| p.weight_of(pubkey)).unwrap_or(1.0)
            };
            let accept_weight: f64 = result.accepting_curators.iter().map(weight_of).sum();
            let reject_weight: f64 = result.rejecting_curators.iter().map(weight_of).sum();
            let total_weight = accept_weight + reject_weight;
            let threshold = aggregation
                .weight_threshold
                .unwrap_or((total_weight / 2.0).floor() + 1.0);

            if accept_weight >= threshold {
                (DecisionValue::Accept, safe_div(accept_weight, total_weight))
            } else if reject_weight >= threshold {
                (DecisionValue::Reject, safe_div(reject_weight, total_weight))
            } else {
                (
                    DecisionValue::Accept,
                    safe_div(accept_weight, threshold).min(1.0),
                )
            }
        }
    };

    result.decision = verdict;
    result.confidence = confidence;

    if result.decision == DecisionValue::Reject {
        result.primary_reason = ReasonCode::strongest(&result.all_reasons);
    }

    result
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn safe_div(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        0.0
    } else {
        part / whole
    }
}

/// Store-backed aggregation front-end.
///
/// Fetches the decision bag, current trust policy, and approved-hash set,
/// runs [`aggregate`], and optionally caches the output on the decision
/// rows.
pub struct AggregationService {
    decisions: DecisionStore,
    trust: TrustPolicyStore,
    rulesets: RulesetStore,
    policy: RwLock<AggregationPolicy>,
}

impl AggregationService {
    /// Create a new aggregation service
    pub fn new(
        decisions: DecisionStore,
        trust: TrustPolicyStore,
        rulesets: RulesetStore,
        policy: AggregationPolicy,
    ) -> Self {
        Self {
            decisions,
            trust,
            rulesets,
            policy: RwLock::new(policy),
        }
    }

    /// Current aggregation policy.
    pub fn policy(&self) -> AggregationPolicy {
        self.policy.read().unwrap().clone()
    }

    /// Replace the aggregation policy.
    pub fn set_policy(&self, policy: AggregationPolicy) {
        *self.policy.write().unwrap() = policy;
    }

    /// Compute the verdict for an infohash from the stores.
    pub async fn verdict_for(&self, infohash: &str) -> AppResult<AggregatedDecision> {
        let decisions = self.decisions.list_for_infohash(infohash).await?;
        let trust = self.trust.get_current().await?;
        let approved_hashes = self.rulesets.approved_hashes().await?;
        let aggregation = self.policy();

        Ok(aggregate(
            infohash,
            &decisions,
            trust.as_ref(),
            &approved_hashes,
            &aggregation,
        ))
    }

    /// Compute the verdict and cache it on the stored decisions.
    pub async fn verdict_and_cache(&self, infohash: &str) -> AppResult<AggregatedDecision> {
        let verdict = self.verdict_for(infohash).await?;
        self.decisions.cache_aggregated(infohash, &verdict).await?;
        Ok(verdict)
    }
}
