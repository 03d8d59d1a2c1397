use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;

use curation::aggregator::AggregationService;
use curation::curator::{Curator, CuratorConfig};
use curation::decision_store::DecisionStore;
use curation::trust_store::TrustPolicyStore;
use explorer::{Explorer, ExplorerConfig};
use moderation::sla::{SlaEnforcer, SlaPolicy};
use moderation::store::ReportStore;
use protocol::identity::Keys;
use protocol::sink::EventSink;
use protocol::store::EventStore;
use relay::admission::{AdmissionConfig, TorrentAdmissionPolicy};
use relay::discovery::{Discovery, DiscoveryConfig, RelayInfo};
use relay::server::{RelayServer, RelayServerConfig};
use ruleset::engine::RuleEngine;
use ruleset::store::RulesetStore;
use shared::database::Database;

use crate::config::Config;

/// Everything main wires together. No globals: each subsystem receives
/// exactly the handles it needs.
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub identity: Keys,
    pub events: EventStore,
    pub decisions: DecisionStore,
    pub rulesets: RulesetStore,
    pub trust: TrustPolicyStore,
    pub reports: ReportStore,
    pub curator: Arc<Curator>,
    pub aggregation: Arc<AggregationService>,
    pub explorer: Arc<Explorer>,
    pub relay_server: Option<RelayServer>,
    pub discovery: Arc<Discovery>,
    pub sla: Arc<SlaEnforcer>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        // Database
        tracing::info!("Opening database...");
        let db = Database::new(&config.database)
            .await
            .context("Failed to open database")?;
        if config.database.run_migrations {
            db.run_migrations()
                .await
                .context("Failed to run migrations")?;
        }
        let pool = db.pool().clone();

        // Instance identity
        let identity = match &config.identity.secret_key {
            Some(secret) => {
                Keys::from_secret_hex(secret).context("Invalid identity.secret_key")?
            }
            None => {
                let keys = Keys::generate();
                tracing::warn!(
                    "No identity configured; generated ephemeral key {}",
                    keys.public_key_hex()
                );
                keys
            }
        };
        tracing::info!("Instance pubkey: {}", identity.public_key_hex());

        // Stores
        let events = EventStore::new(pool.clone());
        let decisions = DecisionStore::new(pool.clone());
        let rulesets = RulesetStore::new(pool.clone());
        let trust = TrustPolicyStore::new(pool.clone());
        let reports = ReportStore::new(pool);

        // Curation
        let engine = Arc::new(RuleEngine::new());
        let curator = Arc::new(Curator::new(
            Some(identity.clone()),
            Arc::clone(&engine),
            events.clone(),
            decisions.clone(),
            rulesets.clone(),
            trust.clone(),
            CuratorConfig {
                semantic_reject_threshold: config.curation.semantic_reject_threshold,
                publish_decisions: config.curation.publish_decisions,
                trusted_admin: config.identity.trusted_admin.clone(),
            },
        ));
        curator
            .reload_rulesets()
            .await
            .context("Failed to load active rulesets")?;

        let aggregation = Arc::new(AggregationService::new(
            decisions.clone(),
            trust.clone(),
            rulesets.clone(),
            config.aggregation.clone(),
        ));

        // Ingest pipeline
        let explorer = Explorer::new(
            ExplorerConfig {
                relays: config.explorer.relays.clone(),
                queue_size: config.explorer.queue_size,
                lookback_hours: config.explorer.lookback_hours,
                ..ExplorerConfig::default()
            },
            Arc::clone(&curator) as Arc<dyn EventSink>,
        );

        // Relay server
        let relay_server = if config.relay.enabled {
            let admission = TorrentAdmissionPolicy::new(AdmissionConfig {
                allow_pubkeys: to_set(&config.relay.admission.allow_pubkeys),
                block_pubkeys: to_set(&config.relay.admission.block_pubkeys),
                block_infohashes: to_set(&config.relay.admission.block_infohashes),
                require_infohash: config.relay.admission.require_infohash,
                require_curation: config.relay.admission.require_curation,
                max_name_length: config.relay.admission.max_name_length,
                max_content_length: config.relay.admission.max_content_length,
                blocked_name_patterns: config.relay.admission.blocked_name_patterns.clone(),
                local_curators: local_curators(&config, &identity),
            });

            Some(RelayServer::new(
                RelayServerConfig {
                    host: config.relay.host.clone(),
                    port: config.relay.port,
                    mode: config.relay.mode,
                    name: config.relay.name.clone(),
                    description: config.relay.description.clone(),
                    public_url: config.relay.public_url.clone(),
                    events_per_minute: config.relay.events_per_minute,
                },
                events.clone(),
                admission,
                Arc::clone(&aggregation),
            ))
        } else {
            None
        };

        // Discovery
        let discovery = Arc::new(Discovery::new(
            DiscoveryConfig {
                announce_interval_secs: config.discovery.announce_interval_secs,
                scan_interval_secs: config.discovery.scan_interval_secs,
                stale_after_secs: config.discovery.stale_after_secs,
                ..DiscoveryConfig::default()
            },
            identity.clone(),
            RelayInfo {
                url: config.relay.public_url.clone(),
                name: config.relay.name.clone(),
                description: config.relay.description.clone(),
                supported_nips: vec![1],
            },
            explorer.pool(),
        ));

        // Moderation
        let sla = Arc::new(SlaEnforcer::new(
            reports.clone(),
            SlaPolicy {
                acknowledgment_deadline_hours: config.sla.acknowledgment_deadline_hours,
                resolution_deadline_days: config.sla.resolution_deadline_days,
                auto_acknowledge: config.sla.auto_acknowledge,
                tick_minutes: config.sla.tick_minutes,
            },
        ));

        Ok(Self {
            config,
            db,
            identity,
            events,
            decisions,
            rulesets,
            trust,
            reports,
            curator,
            aggregation,
            explorer,
            relay_server,
            discovery,
            sla,
        })
    }
}

fn to_set(values: &[String]) -> HashSet<String> {
    values.iter().cloned().collect()
}

fn local_curators(config: &Config, identity: &Keys) -> HashSet<String> {
    let mut curators = to_set(&config.relay.admission.local_curators);
    // The instance's own curator always counts as local.
    curators.insert(identity.public_key_hex().to_string());
    curators
}
