//! Curation: signed decisions, federated trust, and aggregation.
//!
//! Curators evaluate torrent announcements against their rulesets and sign
//! accept/reject decisions. Each instance holds a signed trust policy
//! naming the curators it listens to, and an aggregator that folds many
//! curators' decisions on one infohash into a single verdict.

pub mod aggregator;
pub mod curator;
pub mod decision;
pub mod decision_store;
pub mod trust;
pub mod trust_store;

pub use aggregator::{
    aggregate, AggregatedDecision, AggregationMode, AggregationPolicy, AggregationService,
};
pub use curator::{Curator, CuratorConfig};
pub use decision::{DecisionValue, VerificationDecision};
pub use decision_store::DecisionStore;
pub use trust::{CuratorEntry, RevokedKey, TrustPolicy, TrustStatus};
pub use trust_store::{CuratorTrustRow, TrustPolicyStore};
