//! The explorer: bounded ingest between the relay pool and the curator.
//!
//! Many upstream relay readers push into a single bounded queue; one
//! consumer drains it and invokes the handler serially, so store writes
//! from ingest are single-threaded. A full queue drops the event and
//! counts it instead of ever blocking a socket reader. Maintenance runs on
//! one-minute (stats) and five-minute (reconnect sweep) ticks.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use protocol::event::Event;
use protocol::filter::Filter;
use protocol::kinds;
use protocol::sink::EventSink;
use relay::pool::{EventIngest, RelayPool, RelayPoolConfig};
use shared::types::now_ts;

/// Stats tick interval.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Reconnect sweep interval.
const RECONNECT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Deadline after which a historical catch-up subscription is dropped.
const HISTORICAL_DEADLINE: Duration = Duration::from_secs(300);

/// Subscription id used for the live ingest stream.
const INGEST_SUBSCRIPTION: &str = "ingest";

/// Explorer settings.
#[derive(Debug, Clone)]
pub struct ExplorerConfig {
    /// Upstream relay URLs
    pub relays: Vec<String>,
    /// Ingest queue capacity
    pub queue_size: usize,
    /// Live subscription lookback in hours
    pub lookback_hours: i64,
    /// Kinds the ingest subscription asks for
    pub kinds: Vec<u32>,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            queue_size: 1000,
            lookback_hours: 24,
            kinds: vec![kinds::TORRENT, kinds::TORRENT_COMMENT, kinds::CURATOR_DECISION],
        }
    }
}

#[derive(Default)]
struct StatsInner {
    events_discovered: AtomicU64,
    events_queued: AtomicU64,
    events_dropped: AtomicU64,
    last_event_at: AtomicI64,
    started_at: AtomicI64,
}

/// Point-in-time explorer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplorerStats {
    pub events_discovered: u64,
    pub events_queued: u64,
    pub events_dropped: u64,
    pub relays_connected: usize,
    pub last_event_at: Option<i64>,
    pub started_at: Option<i64>,
    pub queue_length: usize,
}

/// Producer side of the ingest queue; shared with every relay reader.
struct QueueIngest {
    sender: mpsc::Sender<(String, Event)>,
    stats: Arc<StatsInner>,
}

impl EventIngest for QueueIngest {
    fn deliver(&self, relay_url: &str, event: Event) {
        self.stats.events_discovered.fetch_add(1, Ordering::Relaxed);

        // try_send keeps the socket reader non-blocking; a full queue
        // back-pressures by dropping.
        match self.sender.try_send((relay_url.to_string(), event)) {
            Ok(()) => {
                self.stats.events_queued.fetch_add(1, Ordering::Relaxed);
                self.stats.last_event_at.store(now_ts(), Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The explorer.
pub struct Explorer {
    config: ExplorerConfig,
    pool: Arc<RelayPool>,
    handler: Arc<dyn EventSink>,
    stats: Arc<StatsInner>,
    sender: mpsc::Sender<(String, Event)>,
    receiver: Mutex<Option<mpsc::Receiver<(String, Event)>>>,
    cancel: CancellationToken,
}

impl Explorer {
    /// Create an explorer over the configured upstreams.
    pub fn new(config: ExplorerConfig, handler: Arc<dyn EventSink>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        let stats = Arc::new(StatsInner::default());

        let ingest = Arc::new(QueueIngest {
            sender: sender.clone(),
            stats: Arc::clone(&stats),
        });

        let pool = RelayPool::new(
            RelayPoolConfig {
                relays: config.relays.clone(),
                ..RelayPoolConfig::default()
            },
            ingest,
        );

        Arc::new(Self {
            config,
            pool,
            handler,
            stats,
            sender,
            receiver: Mutex::new(Some(receiver)),
            cancel: CancellationToken::new(),
        })
    }

    /// The underlying relay pool (for publish fan-out and discovery).
    pub fn pool(&self) -> Arc<RelayPool> {
        Arc::clone(&self.pool)
    }

    /// Start the pool, the live subscription, the consumer, and the
    /// maintenance ticks.
    pub fn start(self: &Arc<Self>) {
        self.stats.started_at.store(now_ts(), Ordering::Relaxed);

        self.pool.start();

        let since = now_ts() - self.config.lookback_hours * 3600;
        self.pool.subscribe(
            INGEST_SUBSCRIPTION,
            vec![Filter::new().kinds(self.config.kinds.clone()).since(since)],
        );

        info!(
            relays = self.config.relays.len(),
            queue_size = self.config.queue_size,
            lookback_hours = self.config.lookback_hours,
            "Explorer started"
        );

        // Single consumer: handler invocations are serial.
        let Some(mut receiver) = self.receiver.lock().unwrap().take() else {
            warn!("Explorer started twice; consumer already running");
            return;
        };
        let consumer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = consumer.cancel.cancelled() => {
                        debug!("Explorer consumer stopping");
                        return;
                    }
                    item = receiver.recv() => match item {
                        Some((relay_url, event)) => {
                            if let Err(e) = consumer.handler.handle_event(&relay_url, event).await {
                                warn!("Event handler failed: {}", e);
                            }
                        }
                        None => return,
                    }
                }
            }
        });

        let maintainer = Arc::clone(self);
        tokio::spawn(async move {
            let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
            let mut sweep_tick = tokio::time::interval(RECONNECT_SWEEP_INTERVAL);
            stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = maintainer.cancel.cancelled() => return,
                    _ = stats_tick.tick() => {
                        let stats = maintainer.stats();
                        debug!(
                            discovered = stats.events_discovered,
                            queued = stats.events_queued,
                            dropped = stats.events_dropped,
                            connected = stats.relays_connected,
                            queue = stats.queue_length,
                            "Explorer stats"
                        );
                    }
                    _ = sweep_tick.tick() => {
                        maintainer.pool.reconnect_stale();
                    }
                }
            }
        });
    }

    /// Cancel the consumer and close every upstream connection.
    pub fn stop(&self) {
        info!("Explorer stopping");
        self.cancel.cancel();
        self.pool.stop();
    }

    /// Re-issue the ingest subscription with a broader lookback. The
    /// temporary subscription is dropped after the catch-up deadline.
    pub fn fetch_historical(self: &Arc<Self>, days: i64) {
        let since = now_ts() - days * 86_400;
        let subscription_id = format!("historical-{}", days);

        info!(days, "Requesting historical catch-up");
        self.pool.subscribe(
            &subscription_id,
            vec![Filter::new().kinds(self.config.kinds.clone()).since(since)],
        );

        let explorer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = explorer.cancel.cancelled() => {}
                _ = tokio::time::sleep(HISTORICAL_DEADLINE) => {}
            }
            explorer.pool.unsubscribe(&subscription_id);
        });
    }

    /// Current statistics.
    pub fn stats(&self) -> ExplorerStats {
        let last_event_at = self.stats.last_event_at.load(Ordering::Relaxed);
        let started_at = self.stats.started_at.load(Ordering::Relaxed);

        ExplorerStats {
            events_discovered: self.stats.events_discovered.load(Ordering::Relaxed),
            events_queued: self.stats.events_queued.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            relays_connected: self.pool.connected_count(),
            last_event_at: (last_event_at > 0).then_some(last_event_at),
            started_at: (started_at > 0).then_some(started_at),
            queue_length: self.config.queue_size.saturating_sub(self.sender.capacity()),
        }
    }

    #[cfg(test)]
    fn ingest_for_test(&self) -> QueueIngest {
        QueueIngest {
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use protocol::identity::Keys;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        seen: StdMutex<Vec<(String, Event)>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn handle_event(&self, source: &str, event: Event) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push((source.to_string(), event));
            Ok(())
        }
    }

    fn event() -> Event {
        Keys::generate()
            .sign(kinds::TORRENT, vec![], String::new(), 1_700_000_000)
            .unwrap()
    }

    #[tokio::test]
    async fn test_backpressure_drops_when_queue_full() {
        // Queue capacity 2, no consumer running: three events in a burst.
        let handler = Arc::new(RecordingSink {
            seen: StdMutex::new(Vec::new()),
        });
        let explorer = Explorer::new(
            ExplorerConfig {
                queue_size: 2,
                ..ExplorerConfig::default()
            },
            handler,
        );

        let ingest = explorer.ingest_for_test();
        ingest.deliver("wss://relay.test", event());
        ingest.deliver("wss://relay.test", event());
        ingest.deliver("wss://relay.test", event());

        let stats = explorer.stats();
        assert_eq!(stats.events_discovered, 3);
        assert_eq!(stats.events_queued, 2);
        assert_eq!(stats.events_dropped, 1);
        assert_eq!(stats.queue_length, 2);
    }

    #[tokio::test]
    async fn test_consumer_drains_serially_into_handler() {
        let handler = Arc::new(RecordingSink {
            seen: StdMutex::new(Vec::new()),
        });
        let explorer = Explorer::new(
            ExplorerConfig {
                queue_size: 16,
                ..ExplorerConfig::default()
            },
            Arc::clone(&handler) as Arc<dyn EventSink>,
        );
        explorer.start();

        let ingest = explorer.ingest_for_test();
        let first = event();
        let second = event();
        ingest.deliver("wss://a.test", first.clone());
        ingest.deliver("wss://b.test", second.clone());

        // Give the consumer a moment to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "wss://a.test");
        assert_eq!(seen[0].1, first);
        assert_eq!(seen[1].1, second);

        explorer.stop();
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let handler = Arc::new(RecordingSink {
            seen: StdMutex::new(Vec::new()),
        });
        let explorer = Explorer::new(ExplorerConfig::default(), handler);

        let stats = explorer.stats();
        assert_eq!(stats, ExplorerStats::default());
    }
}
