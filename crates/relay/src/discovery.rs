//! Relay discovery.
//!
//! On an interval the instance announces its own relay as a kind-30166
//! event and scans known relays for announcements from peers. Discovered
//! relays live in an in-memory registry with health derived from how
//! recently they were seen.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use protocol::event::Event;
use protocol::filter::Filter;
use protocol::identity::Keys;
use protocol::kinds;
use shared::error::AppResult;
use shared::types::now_ts;

use crate::client;
use crate::pool::RelayPool;

/// Discovery loop settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Announce interval
    pub announce_interval_secs: u64,
    /// Scan interval
    pub scan_interval_secs: u64,
    /// Relays unseen this long are unhealthy
    pub stale_after_secs: i64,
    /// Deadline for one scan fetch
    pub scan_fetch_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval_secs: 3600,
            scan_interval_secs: 900,
            stale_after_secs: 86_400,
            scan_fetch_timeout_secs: 30,
        }
    }
}

/// What the instance advertises about its relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub url: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub supported_nips: Vec<u32>,
}

/// A peer relay learned through announcements.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredRelay {
    pub url: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
    pub healthy: bool,
}

/// The discovery component.
pub struct Discovery {
    config: DiscoveryConfig,
    identity: Keys,
    info: RelayInfo,
    pool: Arc<RelayPool>,
    known: RwLock<HashMap<String, DiscoveredRelay>>,
}

impl Discovery {
    /// Create a new discovery component
    pub fn new(
        config: DiscoveryConfig,
        identity: Keys,
        info: RelayInfo,
        pool: Arc<RelayPool>,
    ) -> Self {
        Self {
            config,
            identity,
            info,
            pool,
            known: RwLock::new(HashMap::new()),
        }
    }

    /// Build the signed relay-announcement event.
    pub fn build_announcement(&self) -> AppResult<Event> {
        let mut tags = vec![
            vec!["d".to_string(), self.info.url.clone()],
            vec!["r".to_string(), self.info.url.clone()],
            vec!["name".to_string(), self.info.name.clone()],
            vec!["description".to_string(), self.info.description.clone()],
        ];
        for nip in &self.info.supported_nips {
            tags.push(vec!["nip".to_string(), nip.to_string()]);
        }

        let content = serde_json::to_string(&self.info)?;
        let event = self
            .identity
            .sign(kinds::RELAY_ANNOUNCEMENT, tags, content, now_ts())?;
        Ok(event)
    }

    /// Publish the announcement through the pool.
    pub async fn announce(&self) -> AppResult<()> {
        let event = self.build_announcement()?;
        let results = self.pool.publish(&event, None).await;
        let delivered = results.values().filter(|ok| **ok).count();
        info!(
            "Announced relay {} to {}/{} upstreams",
            self.info.url,
            delivered,
            results.len()
        );
        Ok(())
    }

    /// Record every non-self relay referenced by an announcement event.
    pub fn record(&self, event: &Event) {
        let name = event.tag_value("name").map(str::to_string);
        let description = event.tag_value("description").map(str::to_string);
        let now = now_ts();

        let mut known = self.known.write().unwrap();
        for url in event.tag_values("r") {
            if url == self.info.url || url.is_empty() {
                continue;
            }

            known
                .entry(url.to_string())
                .and_modify(|relay| {
                    relay.last_seen = now;
                    relay.healthy = true;
                    if relay.name.is_none() {
                        relay.name = name.clone();
                    }
                    if relay.description.is_none() {
                        relay.description = description.clone();
                    }
                })
                .or_insert_with(|| DiscoveredRelay {
                    url: url.to_string(),
                    name: name.clone(),
                    description: description.clone(),
                    first_seen: now,
                    last_seen: now,
                    healthy: true,
                });
        }
    }

    /// Subscribe for announcements on the given relays and record them.
    pub async fn scan(&self, urls: &[String]) -> AppResult<usize> {
        let filter = Filter::new()
            .kinds(vec![kinds::RELAY_ANNOUNCEMENT])
            .since(now_ts() - self.config.stale_after_secs);
        let deadline = Duration::from_secs(self.config.scan_fetch_timeout_secs);

        let mut recorded = 0;
        for url in urls {
            match client::fetch_events(url, vec![filter.clone()], deadline).await {
                Ok(events) => {
                    for event in events {
                        if event.verify().is_ok() {
                            self.record(&event);
                            recorded += 1;
                        }
                    }
                }
                Err(e) => debug!("Scan of {} failed: {}", url, e),
            }
        }

        self.refresh_health();
        Ok(recorded)
    }

    /// Mark relays unhealthy once they age past the stale window.
    pub fn refresh_health(&self) {
        let cutoff = now_ts() - self.config.stale_after_secs;
        let mut known = self.known.write().unwrap();
        for relay in known.values_mut() {
            relay.healthy = relay.last_seen >= cutoff;
        }
    }

    /// Delete relays unseen for longer than `max_age_secs`. Returns how
    /// many were removed.
    pub fn prune_stale(&self, max_age_secs: i64) -> usize {
        let cutoff = now_ts() - max_age_secs;
        let mut known = self.known.write().unwrap();
        let before = known.len();
        known.retain(|_, relay| relay.last_seen >= cutoff);
        before - known.len()
    }

    /// Every known peer relay.
    pub fn known_relays(&self) -> Vec<DiscoveredRelay> {
        let mut relays: Vec<DiscoveredRelay> =
            self.known.read().unwrap().values().cloned().collect();
        relays.sort_by(|a, b| a.url.cmp(&b.url));
        relays
    }

    /// Announce and scan on their intervals until cancelled.
    pub async fn run(self: Arc<Self>, scan_urls: Vec<String>, cancel: CancellationToken) {
        let mut announce_tick =
            tokio::time::interval(Duration::from_secs(self.config.announce_interval_secs));
        let mut scan_tick =
            tokio::time::interval(Duration::from_secs(self.config.scan_interval_secs));
        announce_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        scan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Discovery started for relay {}", self.info.url);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Discovery stopping");
                    return;
                }
                _ = announce_tick.tick() => {
                    if let Err(e) = self.announce().await {
                        warn!("Announce failed: {}", e);
                    }
                }
                _ = scan_tick.tick() => {
                    match self.scan(&scan_urls).await {
                        Ok(recorded) => debug!("Scan recorded {} announcements", recorded),
                        Err(e) => warn!("Scan failed: {}", e),
                    }
                }
            }
        }
    }
}
