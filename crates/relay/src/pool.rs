//! Outbound relay connection pool.
//!
//! One long-lived WebSocket per configured upstream. Each connection walks
//! disconnected -> connecting -> connected, re-issues the registered
//! subscriptions on connect, and reconnects under a capped exponential
//! backoff. A sweeper pokes relays that have sat disconnected too long.
//! Incoming events are handed to the [`EventIngest`] without ever blocking
//! the socket reader.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use protocol::event::Event;
use protocol::filter::Filter;
use protocol::messages::{ClientMessage, RelayMessage};
use shared::types::now_ts;

/// Receiver for events read off upstream sockets. Must not block.
pub trait EventIngest: Send + Sync {
    /// Deliver one event from the given relay.
    fn deliver(&self, relay_url: &str, event: Event);
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct RelayPoolConfig {
    /// Upstream relay URLs
    pub relays: Vec<String>,
    /// Force a reconnect attempt after this long disconnected
    pub reconnect_stale_secs: i64,
    /// Publish fan-out deadline
    pub publish_timeout_secs: u64,
    /// Reconnect backoff base
    pub backoff_base_secs: u64,
    /// Reconnect backoff cap
    pub backoff_cap_secs: u64,
}

impl Default for RelayPoolConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            reconnect_stale_secs: 300,
            publish_timeout_secs: 30,
            backoff_base_secs: 2,
            backoff_cap_secs: 120,
        }
    }
}

enum RelayCommand {
    Frame(ClientMessage),
    Publish {
        event: Box<Event>,
        ack: oneshot::Sender<bool>,
    },
}

struct RelayShared {
    state: ConnectionState,
    attempts: u32,
    last_event_at: Option<i64>,
    disconnected_since: Option<i64>,
    commands: Option<mpsc::UnboundedSender<RelayCommand>>,
    wake: Arc<Notify>,
}

impl RelayShared {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_event_at: None,
            disconnected_since: Some(now_ts()),
            commands: None,
            wake: Arc::new(Notify::new()),
        }
    }
}

/// Point-in-time view of one upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub url: String,
    pub state: ConnectionState,
    pub attempts: u32,
    pub last_event_at: Option<i64>,
}

/// The outbound connection pool.
pub struct RelayPool {
    config: RelayPoolConfig,
    relays: Mutex<HashMap<String, RelayShared>>,
    subscriptions: Mutex<HashMap<String, Vec<Filter>>>,
    ingest: Arc<dyn EventIngest>,
    cancel: CancellationToken,
}

impl RelayPool {
    /// Create a pool over the configured upstreams.
    pub fn new(config: RelayPoolConfig, ingest: Arc<dyn EventIngest>) -> Arc<Self> {
        let relays = config
            .relays
            .iter()
            .map(|url| (url.clone(), RelayShared::new()))
            .collect();

        Arc::new(Self {
            config,
            relays: Mutex::new(relays),
            subscriptions: Mutex::new(HashMap::new()),
            ingest,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn one connection task per upstream.
    pub fn start(self: &Arc<Self>) {
        let urls: Vec<String> = self.relays.lock().unwrap().keys().cloned().collect();
        info!("Starting relay pool with {} upstreams", urls.len());
        for url in urls {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                run_relay(pool, url).await;
            });
        }
    }

    /// Cancel every connection task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Register a subscription and issue it to every connected relay.
    /// Re-registering a subscription id replaces its filters and re-issues.
    pub fn subscribe(&self, subscription_id: &str, filters: Vec<Filter>) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription_id.to_string(), filters.clone());

        let frame = ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters,
        };
        self.send_to_connected(frame);
    }

    /// Drop a subscription everywhere.
    pub fn unsubscribe(&self, subscription_id: &str) {
        self.subscriptions.lock().unwrap().remove(subscription_id);
        self.send_to_connected(ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        });
    }

    fn send_to_connected(&self, frame: ClientMessage) {
        let senders: Vec<mpsc::UnboundedSender<RelayCommand>> = self
            .relays
            .lock()
            .unwrap()
            .values()
            .filter_map(|shared| shared.commands.clone())
            .collect();

        for sender in senders {
            let _ = sender.send(RelayCommand::Frame(frame.clone()));
        }
    }

    /// Publish an event to the given relays (all of them when `None`),
    /// collecting per-relay success without exceeding the pool's publish
    /// deadline.
    pub async fn publish(
        &self,
        event: &Event,
        relay_urls: Option<&[String]>,
    ) -> HashMap<String, bool> {
        let targets: Vec<String> = match relay_urls {
            Some(urls) => urls.to_vec(),
            None => self.relays.lock().unwrap().keys().cloned().collect(),
        };

        let mut results: HashMap<String, bool> = HashMap::new();
        let mut pending: Vec<(String, oneshot::Receiver<bool>)> = Vec::new();

        {
            let relays = self.relays.lock().unwrap();
            for url in targets {
                match relays.get(&url).and_then(|shared| shared.commands.clone()) {
                    Some(sender) => {
                        let (ack, receiver) = oneshot::channel();
                        let command = RelayCommand::Publish {
                            event: Box::new(event.clone()),
                            ack,
                        };
                        if sender.send(command).is_ok() {
                            pending.push((url, receiver));
                        } else {
                            results.insert(url, false);
                        }
                    }
                    None => {
                        results.insert(url, false);
                    }
                }
            }
        }

        let deadline = Duration::from_secs(self.config.publish_timeout_secs);
        for (url, receiver) in pending {
            let delivered = matches!(
                tokio::time::timeout(deadline, receiver).await,
                Ok(Ok(true))
            );
            results.insert(url, delivered);
        }

        results
    }

    /// Number of connected upstreams.
    pub fn connected_count(&self) -> usize {
        self.relays
            .lock()
            .unwrap()
            .values()
            .filter(|shared| shared.state == ConnectionState::Connected)
            .count()
    }

    /// Status of every upstream.
    pub fn status(&self) -> Vec<RelayStatus> {
        self.relays
            .lock()
            .unwrap()
            .iter()
            .map(|(url, shared)| RelayStatus {
                url: url.clone(),
                state: shared.state,
                attempts: shared.attempts,
                last_event_at: shared.last_event_at,
            })
            .collect()
    }

    /// Poke relays that have been disconnected longer than the stale
    /// period so they retry immediately.
    pub fn reconnect_stale(&self) {
        let cutoff = now_ts() - self.config.reconnect_stale_secs;
        let relays = self.relays.lock().unwrap();
        for (url, shared) in relays.iter() {
            if shared.state == ConnectionState::Disconnected
                && shared.disconnected_since.is_some_and(|since| since < cutoff)
            {
                debug!("Forcing reconnect of stale relay {}", url);
                shared.wake.notify_one();
            }
        }
    }

    fn subscriptions_snapshot(&self) -> Vec<(String, Vec<Filter>)> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, filters)| (id.clone(), filters.clone()))
            .collect()
    }

    fn update_relay<F: FnOnce(&mut RelayShared)>(&self, url: &str, update: F) {
        if let Some(shared) = self.relays.lock().unwrap().get_mut(url) {
            update(shared);
        }
    }

    fn wake_handle(&self, url: &str) -> Arc<Notify> {
        self.relays
            .lock()
            .unwrap()
            .get(url)
            .map(|shared| Arc::clone(&shared.wake))
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }
}

async fn run_relay(pool: Arc<RelayPool>, url: String) {
    let wake = pool.wake_handle(&url);

    loop {
        if pool.cancel.is_cancelled() {
            return;
        }

        pool.update_relay(&url, |shared| shared.state = ConnectionState::Connecting);

        match connect_async(&url).await {
            Ok((stream, _)) => {
                info!("Connected to relay {}", url);
                let (mut sink, mut source) = stream.split();
                let (command_tx, mut command_rx) = mpsc::unbounded_channel();

                pool.update_relay(&url, |shared| {
                    shared.state = ConnectionState::Connected;
                    shared.attempts = 0;
                    shared.disconnected_since = None;
                    shared.commands = Some(command_tx);
                });

                // Issue every registered subscription on this fresh socket.
                let mut healthy = true;
                for (subscription_id, filters) in pool.subscriptions_snapshot() {
                    let frame = ClientMessage::Req {
                        subscription_id,
                        filters,
                    };
                    match frame.to_json() {
                        Ok(json) => {
                            if sink.send(WsMessage::Text(json)).await.is_err() {
                                healthy = false;
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to encode subscription: {}", e),
                    }
                }

                while healthy {
                    tokio::select! {
                        _ = pool.cancel.cancelled() => {
                            let _ = sink.close().await;
                            return;
                        }
                        command = command_rx.recv() => match command {
                            Some(RelayCommand::Frame(frame)) => {
                                let json = match frame.to_json() {
                                    Ok(json) => json,
                                    Err(e) => {
                                        warn!("Failed to encode frame for {}: {}", url, e);
                                        continue;
                                    }
                                };
                                if sink.send(WsMessage::Text(json)).await.is_err() {
                                    healthy = false;
                                }
                            }
                            Some(RelayCommand::Publish { event, ack }) => {
                                let sent = match ClientMessage::Event(event).to_json() {
                                    Ok(json) => sink.send(WsMessage::Text(json)).await.is_ok(),
                                    Err(_) => false,
                                };
                                let _ = ack.send(sent);
                                if !sent {
                                    healthy = false;
                                }
                            }
                            None => healthy = false,
                        },
                        frame = source.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => match RelayMessage::from_json(&text) {
                                Ok(RelayMessage::Event { event, .. }) => {
                                    pool.update_relay(&url, |shared| {
                                        shared.last_event_at = Some(now_ts());
                                    });
                                    pool.ingest.deliver(&url, *event);
                                }
                                Ok(RelayMessage::Notice { message }) => {
                                    debug!("Notice from {}: {}", url, message);
                                }
                                Ok(_) => {}
                                Err(e) => debug!("Undecodable frame from {}: {}", url, e),
                            },
                            Some(Ok(WsMessage::Close(_))) | None => healthy = false,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Read error from {}: {}", url, e);
                                healthy = false;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                debug!("Failed to connect to {}: {}", url, e);
            }
        }

        let attempts = {
            let mut attempts = 0;
            pool.update_relay(&url, |shared| {
                shared.state = ConnectionState::Disconnected;
                shared.attempts += 1;
                shared.disconnected_since = Some(now_ts());
                shared.commands = None;
                attempts = shared.attempts;
            });
            attempts
        };

        let backoff = backoff_secs(
            pool.config.backoff_base_secs,
            pool.config.backoff_cap_secs,
            attempts,
        );
        debug!("Relay {} disconnected; retrying in {}s", url, backoff);

        tokio::select! {
            _ = pool.cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            _ = wake.notified() => {}
        }
    }
}

fn backoff_secs(base: u64, cap: u64, attempts: u32) -> u64 {
    let shift = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u64 << shift).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::identity::Keys;
    use std::sync::Mutex as StdMutex;

    struct NullIngest;

    impl EventIngest for NullIngest {
        fn deliver(&self, _relay_url: &str, _event: Event) {}
    }

    struct RecordingIngest {
        seen: StdMutex<Vec<(String, Event)>>,
    }

    impl EventIngest for RecordingIngest {
        fn deliver(&self, relay_url: &str, event: Event) {
            self.seen
                .lock()
                .unwrap()
                .push((relay_url.to_string(), event));
        }
    }

    fn pool_with(urls: &[&str]) -> Arc<RelayPool> {
        let config = RelayPoolConfig {
            relays: urls.iter().map(|u| u.to_string()).collect(),
            publish_timeout_secs: 1,
            ..RelayPoolConfig::default()
        };
        RelayPool::new(config, Arc::new(NullIngest))
    }

    #[test]
    fn test_backoff_is_capped_exponential() {
        assert_eq!(backoff_secs(2, 120, 1), 2);
        assert_eq!(backoff_secs(2, 120, 2), 4);
        assert_eq!(backoff_secs(2, 120, 3), 8);
        assert_eq!(backoff_secs(2, 120, 10), 120);
        assert_eq!(backoff_secs(2, 120, 60), 120);
    }

    #[tokio::test]
    async fn test_new_pool_starts_disconnected() {
        let pool = pool_with(&["wss://one.test", "wss://two.test"]);
        let status = pool.status();
        assert_eq!(status.len(), 2);
        assert!(status
            .iter()
            .all(|s| s.state == ConnectionState::Disconnected));
        assert_eq!(pool.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_to_disconnected_relays_reports_failure() {
        let pool = pool_with(&["wss://down.test"]);
        let event = Keys::generate()
            .sign(2003, vec![], String::new(), 1_700_000_000)
            .unwrap();

        let results = pool.publish(&event, None).await;
        assert_eq!(results.get("wss://down.test"), Some(&false));
    }

    #[tokio::test]
    async fn test_subscriptions_are_retained_for_reconnect() {
        let pool = pool_with(&[]);
        pool.subscribe("torrents", vec![Filter::new().kinds(vec![2003])]);
        assert_eq!(pool.subscriptions_snapshot().len(), 1);

        // Replacing the same id keeps one entry.
        pool.subscribe("torrents", vec![Filter::new().kinds(vec![2003, 2004])]);
        let snapshot = pool.subscriptions_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1[0].kinds, Some(vec![2003, 2004]));

        pool.unsubscribe("torrents");
        assert!(pool.subscriptions_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_is_called_for_delivered_events() {
        let ingest = Arc::new(RecordingIngest {
            seen: StdMutex::new(Vec::new()),
        });
        let event = Keys::generate()
            .sign(2003, vec![], String::new(), 1_700_000_000)
            .unwrap();

        ingest.deliver("wss://one.test", event.clone());

        let seen = ingest.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "wss://one.test");
        assert_eq!(seen[0].1, event);
    }
}
