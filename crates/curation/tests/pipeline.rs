//! End-to-end curation pipeline: a torrent announcement flows through the
//! curator, produces a signed decision, and the aggregator folds local and
//! remote decisions into a verdict.

use std::sync::Arc;

use curation::aggregator::{AggregationMode, AggregationPolicy, AggregationService};
use curation::curator::{Curator, CuratorConfig};
use curation::decision::{DecisionValue, VerificationDecision};
use curation::decision_store::DecisionStore;
use curation::trust::{CuratorEntry, TrustPolicy};
use curation::trust_store::TrustPolicyStore;
use protocol::identity::Keys;
use protocol::kinds;
use protocol::sink::EventSink;
use protocol::store::EventStore;
use ruleset::engine::RuleEngine;
use ruleset::model::{Rule, RuleAction, RuleCondition, RuleType, Ruleset, RulesetType};
use ruleset::reason::ReasonCode;
use ruleset::store::RulesetStore;
use shared::database::Database;
use shared::types::now_ts;

struct Fixture {
    curator: Arc<Curator>,
    identity: Keys,
    decisions: DecisionStore,
    rulesets: RulesetStore,
    trust: TrustPolicyStore,
    aggregation: AggregationService,
}

async fn fixture() -> Fixture {
    let db = Database::connect_memory().await.unwrap();
    db.run_migrations().await.unwrap();
    let pool = db.pool().clone();

    let identity = Keys::generate();
    let decisions = DecisionStore::new(pool.clone());
    let rulesets = RulesetStore::new(pool.clone());
    let trust = TrustPolicyStore::new(pool.clone());

    let curator = Arc::new(Curator::new(
        Some(identity.clone()),
        Arc::new(RuleEngine::new()),
        EventStore::new(pool.clone()),
        decisions.clone(),
        rulesets.clone(),
        trust.clone(),
        CuratorConfig::default(),
    ));

    let aggregation = AggregationService::new(
        decisions.clone(),
        trust.clone(),
        rulesets.clone(),
        AggregationPolicy {
            mode: AggregationMode::Any,
            quorum_required: None,
            weight_threshold: None,
        },
    );

    Fixture {
        curator,
        identity,
        decisions,
        rulesets,
        trust,
        aggregation,
    }
}

fn censoring_ruleset(blocked_infohash: &str) -> Ruleset {
    let mut ruleset = Ruleset {
        id: "baseline-censoring".to_string(),
        name: "Baseline censoring".to_string(),
        ruleset_type: RulesetType::Censoring,
        version: "1.0".to_string(),
        hash: String::new(),
        rules: vec![Rule {
            id: "known-malware".to_string(),
            code: ReasonCode::AbuseMalware,
            rule_type: RuleType::Deterministic,
            action: RuleAction::Reject,
            enabled: true,
            priority: 1,
            condition: RuleCondition::InfohashList {
                infohashes: vec![blocked_infohash.to_string()],
            },
        }],
        created_at: 0,
        deprecated_at: None,
    };
    ruleset.seal().unwrap();
    ruleset
}

fn torrent_event(infohash: &str) -> protocol::event::Event {
    Keys::generate()
        .sign(
            kinds::TORRENT,
            vec![
                vec!["x".to_string(), infohash.to_string()],
                vec!["name".to_string(), "Pipeline Test Upload".to_string()],
                vec!["i".to_string(), "tmdb:42".to_string()],
                vec!["size".to_string(), "2048".to_string()],
            ],
            String::new(),
            now_ts(),
        )
        .unwrap()
}

async fn approve(fixture: &Fixture, curators: &[&Keys]) {
    let mut policy = TrustPolicy {
        policy_id: "local".to_string(),
        version: "1".to_string(),
        hash: String::new(),
        allowlist: curators
            .iter()
            .map(|keys| CuratorEntry {
                pubkey: keys.public_key_hex().to_string(),
                alias: None,
                weight: 1.0,
                approved_ruleset_hashes: vec![],
                added_at: now_ts(),
                notes: None,
            })
            .collect(),
        denylist: vec![],
        revoked: vec![],
        effective_at: now_ts(),
        expires_at: None,
        admin_pubkey: String::new(),
        signature: String::new(),
    };
    policy.sign(&fixture.identity).unwrap();
    fixture.trust.save(&policy).await.unwrap();
    fixture.trust.set_current("local").await.unwrap();
}

#[tokio::test]
async fn torrent_flows_to_aggregated_verdict() {
    let fixture = fixture().await;
    approve(&fixture, &[&fixture.identity]).await;

    // Install an active censoring ruleset blocking one infohash.
    let blocked = "b".repeat(40);
    fixture
        .curator
        .install_ruleset(&censoring_ruleset(&blocked))
        .await
        .unwrap();

    // A clean torrent is accepted.
    let clean = "a".repeat(40);
    fixture
        .curator
        .handle_event("wss://up.test", torrent_event(&clean))
        .await
        .unwrap();

    let verdict = fixture.aggregation.verdict_for(&clean).await.unwrap();
    assert_eq!(verdict.decision, DecisionValue::Accept);
    assert_eq!(verdict.total_curators, 1);
    assert_eq!(
        verdict.accepting_curators,
        vec![fixture.identity.public_key_hex().to_string()]
    );

    // The blocked infohash is rejected with the censoring reason, and the
    // decision records the ruleset that produced it.
    fixture
        .curator
        .handle_event("wss://up.test", torrent_event(&blocked))
        .await
        .unwrap();

    let stored = fixture.decisions.list_for_infohash(&blocked).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].decision, DecisionValue::Reject);
    assert_eq!(stored[0].reason_codes, vec![ReasonCode::AbuseMalware]);
    assert_eq!(stored[0].ruleset_type, Some(RulesetType::Censoring));
    let active_hash = fixture
        .rulesets
        .get_active(RulesetType::Censoring)
        .await
        .unwrap()
        .unwrap()
        .hash;
    assert_eq!(stored[0].ruleset_hash.as_ref(), Some(&active_hash));

    let verdict = fixture.aggregation.verdict_for(&blocked).await.unwrap();
    assert_eq!(verdict.decision, DecisionValue::Reject);
    assert_eq!(verdict.primary_reason, Some(ReasonCode::AbuseMalware));
}

#[tokio::test]
async fn remote_legal_reject_overrides_local_accept() {
    let fixture = fixture().await;
    let remote = Keys::generate();
    approve(&fixture, &[&fixture.identity, &remote]).await;

    let infohash = "c".repeat(40);
    let event = torrent_event(&infohash);

    // Local curator accepts.
    fixture
        .curator
        .handle_event("wss://up.test", event.clone())
        .await
        .unwrap();

    // A remote curator publishes a DMCA reject; it arrives as a kind-30175
    // event through the same pipeline.
    let mut remote_decision = VerificationDecision {
        decision_id: String::new(),
        target_event_id: event.id.clone(),
        target_infohash: infohash.clone(),
        decision: DecisionValue::Reject,
        reason_codes: vec![ReasonCode::LegalDmca],
        ruleset_type: None,
        ruleset_version: None,
        ruleset_hash: None,
        curator_pubkey: String::new(),
        signature: String::new(),
        created_at: now_ts(),
        processed_at: None,
        aggregated_decision: None,
    };
    remote_decision.sign(&remote).unwrap();
    fixture
        .curator
        .handle_event("wss://peer.test", remote_decision.to_event(&remote).unwrap())
        .await
        .unwrap();

    // Legal precedence: the aggregate rejects at full confidence even in
    // accept-friendly `any` mode.
    let verdict = fixture
        .aggregation
        .verdict_and_cache(&infohash)
        .await
        .unwrap();
    assert_eq!(verdict.decision, DecisionValue::Reject);
    assert_eq!(verdict.confidence, 1.0);
    assert_eq!(verdict.primary_reason, Some(ReasonCode::LegalDmca));
    assert_eq!(
        verdict.rejecting_curators,
        vec![remote.public_key_hex().to_string()]
    );

    // The verdict was cached onto the stored decision rows.
    let stored = fixture
        .decisions
        .list_for_infohash(&infohash)
        .await
        .unwrap();
    assert!(stored
        .iter()
        .all(|decision| decision.aggregated_decision.is_some()));
}

#[tokio::test]
async fn unapproved_curators_do_not_count() {
    let fixture = fixture().await;
    approve(&fixture, &[&fixture.identity]).await;

    let stranger = Keys::generate();
    let infohash = "d".repeat(40);

    let mut decision = VerificationDecision {
        decision_id: String::new(),
        target_event_id: "e".repeat(64),
        target_infohash: infohash.clone(),
        decision: DecisionValue::Reject,
        reason_codes: vec![ReasonCode::AbuseSpam],
        ruleset_type: None,
        ruleset_version: None,
        ruleset_hash: None,
        curator_pubkey: String::new(),
        signature: String::new(),
        created_at: now_ts(),
        processed_at: None,
        aggregated_decision: None,
    };
    decision.sign(&stranger).unwrap();
    fixture
        .curator
        .handle_event("wss://peer.test", decision.to_event(&stranger).unwrap())
        .await
        .unwrap();

    // Stored, but filtered out of aggregation: no verdict information.
    let verdict = fixture.aggregation.verdict_for(&infohash).await.unwrap();
    assert_eq!(verdict.decision, DecisionValue::Accept);
    assert_eq!(verdict.confidence, 0.0);
    assert_eq!(verdict.total_curators, 0);
}
