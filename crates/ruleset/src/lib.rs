//! Versioned rulesets and the evaluation engine.
//!
//! Rulesets come in two types: deterministic `censoring` rulesets and
//! probabilistic `semantic` rulesets. Each is content-addressed by a
//! SHA-256 hash and carries an ordered list of rules; the engine evaluates
//! a torrent record against the active ruleset of each type and a final
//! helper folds both results into a single verdict.

pub mod engine;
pub mod model;
pub mod reason;
pub mod store;

pub use engine::{EvaluationResult, MatchedRule, RuleEngine, DEFAULT_SEMANTIC_REJECT_THRESHOLD};
pub use model::{Rule, RuleAction, RuleCondition, RuleType, Ruleset, RulesetType};
pub use reason::{ReasonCategory, ReasonCode};
pub use store::RulesetStore;
