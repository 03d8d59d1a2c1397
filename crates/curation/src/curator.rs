//! The curator: the ingest pipeline's event handler.
//!
//! Torrent announcements are verified, derived into records, evaluated
//! against the active rulesets, and answered with a signed decision.
//! Decisions arriving from remote curators are verified and stored.
//! Without a signing identity the curator runs in evaluation-only mode.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use protocol::event::{Event, TagName};
use protocol::identity::Keys;
use protocol::kinds;
use protocol::sink::EventSink;
use protocol::store::EventStore;
use ruleset::engine::{RuleEngine, DEFAULT_SEMANTIC_REJECT_THRESHOLD};
use ruleset::model::{Ruleset, RulesetType};
use ruleset::reason::ReasonCode;
use shared::error::{AppError, AppResult};
use shared::types::{normalize_infohash, now_ts};
use torrent::record::TorrentRecord;

use crate::decision::{DecisionValue, VerificationDecision};
use crate::decision_store::DecisionStore;
use crate::trust::{sign_revocation, CuratorEntry, TrustPolicy};
use crate::trust_store::TrustPolicyStore;

/// Curator settings.
#[derive(Debug, Clone)]
pub struct CuratorConfig {
    /// Semantic score at or above which a record is rejected
    pub semantic_reject_threshold: f64,
    /// Publish own decisions through the outbox
    pub publish_decisions: bool,
    /// Admin pubkey whose kind-30173 policies are applied from the wire
    pub trusted_admin: Option<String>,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            semantic_reject_threshold: DEFAULT_SEMANTIC_REJECT_THRESHOLD,
            publish_decisions: true,
            trusted_admin: None,
        }
    }
}

/// Point-in-time curator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CuratorStatsSnapshot {
    pub events_seen: u64,
    pub torrents_evaluated: u64,
    pub decisions_created: u64,
    pub remote_decisions_stored: u64,
    pub events_ignored: u64,
}

#[derive(Default)]
struct CuratorStats {
    events_seen: AtomicU64,
    torrents_evaluated: AtomicU64,
    decisions_created: AtomicU64,
    remote_decisions_stored: AtomicU64,
    events_ignored: AtomicU64,
}

/// The curation service.
pub struct Curator {
    keys: Option<Keys>,
    engine: Arc<RuleEngine>,
    events: EventStore,
    decisions: DecisionStore,
    rulesets: ruleset::store::RulesetStore,
    trust: TrustPolicyStore,
    config: CuratorConfig,
    outbox: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    stats: CuratorStats,
}

impl Curator {
    /// Create a new curator
    pub fn new(
        keys: Option<Keys>,
        engine: Arc<RuleEngine>,
        events: EventStore,
        decisions: DecisionStore,
        rulesets: ruleset::store::RulesetStore,
        trust: TrustPolicyStore,
        config: CuratorConfig,
    ) -> Self {
        if keys.is_none() {
            warn!("No signing identity configured; running in evaluation-only mode");
        }

        Self {
            keys,
            engine,
            events,
            decisions,
            rulesets,
            trust,
            config,
            outbox: Mutex::new(None),
            stats: CuratorStats::default(),
        }
    }

    /// Our curator pubkey, when an identity is configured.
    pub fn pubkey(&self) -> Option<&str> {
        self.keys.as_ref().map(Keys::public_key_hex)
    }

    /// Attach the channel accepted events and decisions are published to.
    pub fn set_outbox(&self, sender: mpsc::UnboundedSender<Event>) {
        *self.outbox.lock().unwrap() = Some(sender);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CuratorStatsSnapshot {
        CuratorStatsSnapshot {
            events_seen: self.stats.events_seen.load(Ordering::Relaxed),
            torrents_evaluated: self.stats.torrents_evaluated.load(Ordering::Relaxed),
            decisions_created: self.stats.decisions_created.load(Ordering::Relaxed),
            remote_decisions_stored: self.stats.remote_decisions_stored.load(Ordering::Relaxed),
            events_ignored: self.stats.events_ignored.load(Ordering::Relaxed),
        }
    }

    /// Load the active rulesets from the store into the engine.
    pub async fn reload_rulesets(&self) -> AppResult<()> {
        let censoring = self.rulesets.get_active(RulesetType::Censoring).await?;
        let semantic = self.rulesets.get_active(RulesetType::Semantic).await?;

        info!(
            censoring = censoring.as_ref().map(|r| r.id.as_str()),
            semantic = semantic.as_ref().map(|r| r.id.as_str()),
            "Loading active rulesets into the engine"
        );

        self.engine.set_censoring(censoring);
        self.engine.set_semantic(semantic);
        Ok(())
    }

    fn publish(&self, event: Event) {
        if let Some(sender) = self.outbox.lock().unwrap().as_ref() {
            // A closed outbox only means nobody is relaying right now.
            let _ = sender.send(event);
        }
    }

    /// Evaluate a torrent announcement and persist a signed decision.
    async fn process_torrent(&self, event: &Event) -> AppResult<()> {
        self.stats.torrents_evaluated.fetch_add(1, Ordering::Relaxed);

        let (value, reasons, source) = match TorrentRecord::from_event(event) {
            Ok(record) => {
                let censoring = self.engine.evaluate_censoring(&record);
                let semantic = self.engine.evaluate_semantic(&record);
                let (reject, reasons) = RuleEngine::should_reject(
                    &censoring,
                    &semantic,
                    self.config.semantic_reject_threshold,
                );

                let source = if reasons
                    .iter()
                    .any(|code| censoring.reject_codes().contains(code))
                {
                    self.engine.active(RulesetType::Censoring)
                } else {
                    self.engine.active(RulesetType::Semantic)
                };

                let value = if reject {
                    DecisionValue::Reject
                } else {
                    DecisionValue::Accept
                };
                (value, reasons, source)
            }
            Err(e) => {
                debug!("Torrent {} failed derivation: {}", event.id, e);
                // Without an infohash there is nothing to decide on.
                if TagName::Infohash
                    .value(event)
                    .and_then(|raw| normalize_infohash(raw).ok())
                    .is_none()
                {
                    self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                (DecisionValue::Reject, vec![ReasonCode::SemBadMeta], None)
            }
        };

        let Some(keys) = &self.keys else {
            debug!("Evaluation-only mode; not signing a decision for {}", event.id);
            return Ok(());
        };

        let infohash = TagName::Infohash
            .value(event)
            .and_then(|raw| normalize_infohash(raw).ok())
            .ok_or_else(|| AppError::BadRequest("torrent event lost its infohash".to_string()))?;

        let mut decision = VerificationDecision {
            decision_id: String::new(),
            target_event_id: event.id.clone(),
            target_infohash: infohash,
            decision: value,
            reason_codes: reasons,
            ruleset_type: source.as_ref().map(|r| r.ruleset_type),
            ruleset_version: source.as_ref().map(|r| r.version.clone()),
            ruleset_hash: source.as_ref().map(|r| r.hash.clone()),
            curator_pubkey: String::new(),
            signature: String::new(),
            created_at: now_ts(),
            processed_at: None,
            aggregated_decision: None,
        };
        decision.sign(keys)?;
        self.decisions.save(&decision).await?;
        self.stats.decisions_created.fetch_add(1, Ordering::Relaxed);

        debug!(
            infohash = %decision.target_infohash,
            verdict = %decision.decision,
            "Curated torrent announcement"
        );

        if decision.decision == DecisionValue::Accept {
            // Only accepted announcements enter the index; a reject
            // decision outlives the event it judged.
            self.events.save(event).await?;
            self.publish(event.clone());
        }

        if self.config.publish_decisions {
            let publication = decision.to_event(keys)?;
            self.publish(publication);
        }

        Ok(())
    }

    /// Verify and store a decision published by a remote curator.
    async fn process_remote_decision(&self, event: &Event) -> AppResult<()> {
        let decision = VerificationDecision::from_event(event)?;

        if decision.curator_pubkey != event.pubkey {
            return Err(AppError::BadRequest(
                "decision curator differs from event author".to_string(),
            ));
        }
        decision.validate()?;
        decision
            .verify()
            .map_err(|e| AppError::BadRequest(format!("decision signature invalid: {}", e)))?;

        self.decisions.save(&decision).await?;
        self.events.save(event).await?;
        self.stats
            .remote_decisions_stored
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Apply a trust policy pushed over the wire by the configured admin.
    async fn process_trust_policy(&self, event: &Event) -> AppResult<()> {
        let Some(trusted_admin) = &self.config.trusted_admin else {
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        if event.pubkey != *trusted_admin {
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Wire policies arrive as full JSON in the content.
        let policy: TrustPolicy = serde_json::from_str(&event.content)?;
        if policy.admin_pubkey != *trusted_admin {
            return Err(AppError::BadRequest(
                "policy admin differs from trusted admin".to_string(),
            ));
        }

        self.trust.save(&policy).await?;
        self.trust.set_current(&policy.policy_id).await?;
        info!(policy = %policy.policy_id, "Applied trust policy from wire");
        Ok(())
    }

    // Trust management for the local operator. Each mutation rewrites the
    // policy, re-signs it, and atomically makes it current.

    async fn rewrite_policy<F>(&self, mutate: F) -> AppResult<TrustPolicy>
    where
        F: FnOnce(&mut TrustPolicy),
    {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| AppError::Internal("no signing identity for trust management".to_string()))?;

        let mut policy = self.trust.get_current().await?.unwrap_or_else(|| TrustPolicy {
            policy_id: "local".to_string(),
            version: "0".to_string(),
            hash: String::new(),
            allowlist: vec![],
            denylist: vec![],
            revoked: vec![],
            effective_at: now_ts(),
            expires_at: None,
            admin_pubkey: keys.public_key_hex().to_string(),
            signature: String::new(),
        });

        mutate(&mut policy);

        let next_version = policy.version.parse::<u64>().map_or(1, |v| v + 1);
        policy.version = next_version.to_string();
        policy.effective_at = now_ts();
        policy.sign(keys)?;

        self.trust.save(&policy).await?;
        self.trust.set_current(&policy.policy_id).await?;
        Ok(policy)
    }

    /// Add or update an allowlisted curator.
    pub async fn add_curator(&self, entry: CuratorEntry) -> AppResult<TrustPolicy> {
        self.rewrite_policy(|policy| {
            policy.allowlist.retain(|e| e.pubkey != entry.pubkey);
            policy.denylist.retain(|p| p != &entry.pubkey);
            policy.allowlist.push(entry);
        })
        .await
    }

    /// Revoke a curator key with a self-contained signed revocation.
    pub async fn revoke_curator(&self, pubkey: &str, reason: &str) -> AppResult<TrustPolicy> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| AppError::Internal("no signing identity for trust management".to_string()))?;
        let revoked = sign_revocation(keys, pubkey, reason, now_ts())?;

        self.rewrite_policy(move |policy| {
            policy.allowlist.retain(|e| e.pubkey != revoked.pubkey);
            policy
                .revoked
                .retain(|r| r.pubkey != revoked.pubkey);
            policy.revoked.push(revoked);
        })
        .await
    }

    /// Import a ruleset, activate it, and load it into the engine.
    pub async fn install_ruleset(&self, ruleset: &Ruleset) -> AppResult<Ruleset> {
        let saved = self.rulesets.save(ruleset).await?;
        self.rulesets.activate(&saved.id).await?;
        self.reload_rulesets().await?;
        Ok(saved)
    }
}

#[async_trait]
impl EventSink for Curator {
    async fn handle_event(&self, source: &str, event: Event) -> anyhow::Result<()> {
        self.stats.events_seen.fetch_add(1, Ordering::Relaxed);

        // Malformed events are dropped silently at the boundary.
        if event.verify().is_err() {
            debug!("Dropping unverifiable event {} from {}", event.id, source);
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let outcome = match event.kind {
            kinds::TORRENT => self.process_torrent(&event).await,
            kinds::CURATOR_DECISION => self.process_remote_decision(&event).await,
            kinds::TRUST_POLICY => self.process_trust_policy(&event).await,
            _ => {
                self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!("Failed to process event {} from {}: {}", event.id, source, e);
        }

        Ok(())
    }
}
