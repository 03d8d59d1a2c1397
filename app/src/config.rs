use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::Deserialize;

use curation::aggregator::AggregationPolicy;
use relay::server::RelayMode;
use shared::config::DatabaseConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    pub database: DatabaseConfig,
    pub explorer: ExplorerSection,
    pub relay: RelaySection,
    pub aggregation: AggregationPolicy,
    pub sla: SlaSection,
    pub discovery: DiscoverySection,
    pub curation: CurationSection,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    /// Hex secret key; generated (and logged as a pubkey) when absent
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Admin pubkey whose wire policies this instance applies
    #[serde(default)]
    pub trusted_admin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplorerSection {
    pub relays: Vec<String>,
    pub queue_size: usize,
    pub lookback_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub mode: RelayMode,
    pub name: String,
    pub description: String,
    pub public_url: String,
    pub events_per_minute: u32,
    pub admission: AdmissionSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    pub allow_pubkeys: Vec<String>,
    pub block_pubkeys: Vec<String>,
    pub block_infohashes: Vec<String>,
    pub require_infohash: bool,
    pub require_curation: bool,
    pub max_name_length: usize,
    pub max_content_length: usize,
    pub blocked_name_patterns: Vec<String>,
    pub local_curators: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlaSection {
    pub acknowledgment_deadline_hours: i64,
    pub resolution_deadline_days: i64,
    pub auto_acknowledge: bool,
    pub tick_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    pub enabled: bool,
    pub announce_interval_secs: u64,
    pub scan_interval_secs: u64,
    pub stale_after_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurationSection {
    pub semantic_reject_threshold: f64,
    pub publish_decisions: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub environment: String,
    pub log_level: String,
    pub log_format: String, // "json" or "pretty"
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let environment =
            std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "development".into());

        let config = ConfigBuilder::builder()
            // Start with default values
            .set_default("database.path", "./data/beacon.db")?
            .set_default("database.max_connections", 10)?
            .set_default("database.busy_timeout_secs", 30)?
            .set_default("database.run_migrations", true)?
            .set_default("explorer.relays", Vec::<String>::new())?
            .set_default("explorer.queue_size", 1000)?
            .set_default("explorer.lookback_hours", 24)?
            .set_default("relay.enabled", true)?
            .set_default("relay.host", "0.0.0.0")?
            .set_default("relay.port", 4884)?
            .set_default("relay.mode", "community")?
            .set_default("relay.name", "beacon")?
            .set_default("relay.description", "A federated torrent index relay")?
            .set_default("relay.public_url", "ws://localhost:4884")?
            .set_default("relay.events_per_minute", 30)?
            .set_default("relay.admission.allow_pubkeys", Vec::<String>::new())?
            .set_default("relay.admission.block_pubkeys", Vec::<String>::new())?
            .set_default("relay.admission.block_infohashes", Vec::<String>::new())?
            .set_default("relay.admission.require_infohash", true)?
            .set_default("relay.admission.require_curation", false)?
            .set_default("relay.admission.max_name_length", 500)?
            .set_default("relay.admission.max_content_length", 10_000)?
            .set_default(
                "relay.admission.blocked_name_patterns",
                Vec::<String>::new(),
            )?
            .set_default("relay.admission.local_curators", Vec::<String>::new())?
            .set_default("aggregation.mode", "quorum")?
            .set_default("sla.acknowledgment_deadline_hours", 24)?
            .set_default("sla.resolution_deadline_days", 7)?
            .set_default("sla.auto_acknowledge", false)?
            .set_default("sla.tick_minutes", 15)?
            .set_default("discovery.enabled", true)?
            .set_default("discovery.announce_interval_secs", 3600)?
            .set_default("discovery.scan_interval_secs", 900)?
            .set_default("discovery.stale_after_secs", 86_400)?
            .set_default("curation.semantic_reject_threshold", 0.7)?
            .set_default("curation.publish_decisions", true)?
            .set_default("telemetry.service_name", "beacon")?
            .set_default("telemetry.environment", environment.clone())?
            .set_default("telemetry.log_level", "info")?
            .set_default("telemetry.log_format", "pretty")?
            // Layer config files over the defaults
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            .add_source(File::with_name("beacon").required(false))
            // Environment variables win: BEACON_RELAY__PORT=4885
            .add_source(
                Environment::with_prefix("BEACON")
                    .separator("__")
                    .list_separator(",")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.relay.enabled && self.relay.port == 0 {
            anyhow::bail!("relay.port must be set when the relay is enabled");
        }
        if !(0.0..=1.0).contains(&self.curation.semantic_reject_threshold) {
            anyhow::bail!("curation.semantic_reject_threshold must be in 0..1");
        }
        if self.explorer.queue_size == 0 {
            anyhow::bail!("explorer.queue_size must be positive");
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.telemetry.environment.eq_ignore_ascii_case("production")
    }
}
