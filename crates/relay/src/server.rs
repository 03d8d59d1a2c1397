//! The embedded relay server.
//!
//! A WebSocket endpoint speaking the JSON-array framing: `EVENT`, `REQ`,
//! and `CLOSE` inbound; `EVENT`, `OK`, `EOSE`, and `NOTICE` outbound.
//! Every EVENT submission passes a per-client token bucket, signature
//! verification, kind admissibility, and (for torrents) the admission
//! policy before it is stored and fanned out to matching subscriptions.

use axum::extract::ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use curation::aggregator::AggregationService;
use protocol::event::Event;
use protocol::kinds;
use protocol::messages::{ClientMessage, RelayMessage};
use protocol::store::EventStore;

use crate::admission::TorrentAdmissionPolicy;

/// Which kinds the relay accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Any kind below 10000 plus the federation kinds
    Public,
    /// Only the federation's closed kind set
    Community,
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Community => write!(f, "community"),
        }
    }
}

/// Relay server settings.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Kind admissibility mode
    pub mode: RelayMode,
    /// Relay display name
    pub name: String,
    /// Relay description
    pub description: String,
    /// Publicly reachable WebSocket URL
    pub public_url: String,
    /// Per-client EVENT budget per minute
    pub events_per_minute: u32,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4884,
            mode: RelayMode::Community,
            name: "beacon".to_string(),
            description: "A federated torrent index relay".to_string(),
            public_url: "ws://localhost:4884".to_string(),
            events_per_minute: 30,
        }
    }
}

struct ClientHandle {
    sender: mpsc::UnboundedSender<RelayMessage>,
    subscriptions: HashMap<String, Vec<protocol::filter::Filter>>,
    limiter: DefaultDirectRateLimiter,
}

/// Shared relay server state.
pub struct ServerState {
    config: RelayServerConfig,
    events: EventStore,
    admission: TorrentAdmissionPolicy,
    aggregation: Arc<AggregationService>,
    clients: RwLock<HashMap<u64, ClientHandle>>,
    next_client: AtomicU64,
}

impl ServerState {
    fn kind_allowed(&self, kind: u32) -> bool {
        match self.config.mode {
            // Community relays carry the federation's content kinds only;
            // relay announcements travel over public relays.
            RelayMode::Community => matches!(
                kind,
                kinds::TORRENT
                    | kinds::TORRENT_COMMENT
                    | kinds::TRUST_POLICY
                    | kinds::CURATOR_DECISION
            ),
            RelayMode::Public => kind < 10_000 || kinds::is_federation_kind(kind),
        }
    }

    fn register_client(&self) -> (u64, mpsc::UnboundedReceiver<RelayMessage>) {
        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let quota = Quota::per_minute(
            NonZeroU32::new(self.config.events_per_minute.max(1)).unwrap_or(NonZeroU32::MIN),
        );

        self.clients.write().unwrap().insert(
            client_id,
            ClientHandle {
                sender,
                subscriptions: HashMap::new(),
                limiter: RateLimiter::direct(quota),
            },
        );

        (client_id, receiver)
    }

    fn remove_client(&self, client_id: u64) {
        self.clients.write().unwrap().remove(&client_id);
    }

    fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Fan an accepted event out to every matching subscription.
    fn broadcast(&self, event: &Event) {
        let clients = self.clients.read().unwrap();
        for handle in clients.values() {
            for (subscription_id, filters) in &handle.subscriptions {
                if filters.iter().any(|f| f.matches(event)) {
                    let _ = handle.sender.send(RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event: Box::new(event.clone()),
                    });
                    break;
                }
            }
        }
    }

    /// Handle one inbound text frame; the replies go back to the same
    /// client in order.
    async fn handle_text(&self, client_id: u64, text: &str) -> Vec<RelayMessage> {
        let message = match ClientMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Malformed frame from client {}: {}", client_id, e);
                return vec![RelayMessage::Notice {
                    message: "invalid frame".to_string(),
                }];
            }
        };

        match message {
            ClientMessage::Event(event) => vec![self.handle_event(client_id, *event).await],
            ClientMessage::Req {
                subscription_id,
                filters,
            } => self.handle_req(client_id, subscription_id, filters).await,
            ClientMessage::Close { subscription_id } => {
                if let Some(handle) = self.clients.write().unwrap().get_mut(&client_id) {
                    handle.subscriptions.remove(&subscription_id);
                }
                Vec::new()
            }
        }
    }

    async fn handle_event(&self, client_id: u64, event: Event) -> RelayMessage {
        let ok = |accepted: bool, message: &str| RelayMessage::Ok {
            event_id: event.id.clone(),
            accepted,
            message: message.to_string(),
        };

        // Token bucket per client.
        let within_budget = self
            .clients
            .read()
            .unwrap()
            .get(&client_id)
            .map_or(false, |handle| handle.limiter.check().is_ok());
        if !within_budget {
            return ok(false, "rate-limited: slow down");
        }

        if event.verify().is_err() {
            return ok(false, "invalid: bad id or signature");
        }

        if !self.kind_allowed(event.kind) {
            return ok(false, "blocked: kind not accepted here");
        }

        if event.kind == kinds::TORRENT {
            match self.admission.check(&event, &self.aggregation).await {
                Ok(verdict) if !verdict.is_allowed() => {
                    return ok(false, verdict.reason());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Admission check failed: {}", e);
                    return ok(false, "error: admission check failed");
                }
            }
        }

        match self.events.save(&event).await {
            Ok(_) => {
                self.broadcast(&event);
                ok(true, "")
            }
            Err(e) => {
                warn!("Failed to store event {}: {}", event.id, e);
                ok(false, "error: could not store event")
            }
        }
    }

    async fn handle_req(
        &self,
        client_id: u64,
        subscription_id: String,
        filters: Vec<protocol::filter::Filter>,
    ) -> Vec<RelayMessage> {
        // Retain the subscription for live broadcast.
        if let Some(handle) = self.clients.write().unwrap().get_mut(&client_id) {
            handle
                .subscriptions
                .insert(subscription_id.clone(), filters.clone());
        }

        // Stream stored matches, newest first, then end-of-stored-events.
        let mut replies = Vec::new();
        match self.events.query_many(&filters).await {
            Ok(events) => {
                for event in events {
                    replies.push(RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event: Box::new(event),
                    });
                }
            }
            Err(e) => {
                warn!("Stored-event query failed: {}", e);
            }
        }
        replies.push(RelayMessage::Eose { subscription_id });
        replies
    }
}

/// The relay server.
pub struct RelayServer {
    state: Arc<ServerState>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(
        config: RelayServerConfig,
        events: EventStore,
        admission: TorrentAdmissionPolicy,
        aggregation: Arc<AggregationService>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                events,
                admission,
                aggregation,
                clients: RwLock::new(HashMap::new()),
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// The axum router: the WebSocket endpoint at `/` and `/health`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until cancelled.
    pub async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr).await?;

        info!(
            "Relay server listening on ws://{} (mode: {})",
            addr, self.state.config.mode
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        info!("Relay server stopped");
        Ok(())
    }
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| client_session(state, socket))
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let events = state.events.count().await.unwrap_or(0);
    Json(json!({
        "status": "ok",
        "mode": state.config.mode.to_string(),
        "clients": state.client_count(),
        "events": events,
    }))
}

async fn client_session(state: Arc<ServerState>, socket: WebSocket) {
    let (client_id, mut outbound) = state.register_client();
    debug!("Client {} connected", client_id);

    let (mut sink, mut source) = socket.split();

    // Writer: drains the client's outbound queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message.to_json() {
                Ok(json) => {
                    if sink.send(AxumWsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode outbound frame: {}", e),
            }
        }
        let _ = sink.close().await;
    });

    // Reader: frames in, replies queued behind any broadcasts in flight.
    while let Some(frame) = source.next().await {
        match frame {
            Ok(AxumWsMessage::Text(text)) => {
                let replies = state.handle_text(client_id, &text).await;
                let clients = state.clients.read().unwrap();
                if let Some(handle) = clients.get(&client_id) {
                    for reply in replies {
                        let _ = handle.sender.send(reply);
                    }
                }
            }
            Ok(AxumWsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.remove_client(client_id);
    writer.abort();
    debug!("Client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use curation::aggregator::{AggregationPolicy, AggregationService};
    use curation::decision::{DecisionValue, VerificationDecision};
    use curation::decision_store::DecisionStore;
    use curation::trust::{CuratorEntry, TrustPolicy};
    use curation::trust_store::TrustPolicyStore;
    use protocol::filter::Filter;
    use protocol::identity::Keys;
    use ruleset::store::RulesetStore;
    use shared::database::Database;
    use shared::types::now_ts;

    struct Harness {
        state: Arc<ServerState>,
        trust: TrustPolicyStore,
        decisions: DecisionStore,
    }

    async fn harness(mode: RelayMode, admission: AdmissionConfig) -> Harness {
        let db = Database::connect_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let pool = db.pool().clone();

        let decisions = DecisionStore::new(pool.clone());
        let trust = TrustPolicyStore::new(pool.clone());
        let aggregation = Arc::new(AggregationService::new(
            decisions.clone(),
            trust.clone(),
            RulesetStore::new(pool.clone()),
            AggregationPolicy::default(),
        ));

        let server = RelayServer::new(
            RelayServerConfig {
                mode,
                ..RelayServerConfig::default()
            },
            EventStore::new(pool),
            TorrentAdmissionPolicy::new(admission),
            aggregation,
        );

        Harness {
            state: server.state,
            trust,
            decisions,
        }
    }

    fn torrent_event(keys: &Keys, infohash: &str) -> Event {
        keys.sign(
            kinds::TORRENT,
            vec![
                vec!["x".to_string(), infohash.to_string()],
                vec!["name".to_string(), "A Torrent".to_string()],
                vec!["i".to_string(), "imdb:tt1".to_string()],
            ],
            String::new(),
            now_ts(),
        )
        .unwrap()
    }

    fn frame(event: &Event) -> String {
        ClientMessage::Event(Box::new(event.clone())).to_json().unwrap()
    }

    async fn approve_curator(harness: &Harness, admin: &Keys, curator: &Keys) {
        let mut policy = TrustPolicy {
            policy_id: "p1".to_string(),
            version: "1".to_string(),
            hash: String::new(),
            allowlist: vec![CuratorEntry {
                pubkey: curator.public_key_hex().to_string(),
                alias: None,
                weight: 1.0,
                approved_ruleset_hashes: vec![],
                added_at: now_ts(),
                notes: None,
            }],
            denylist: vec![],
            revoked: vec![],
            effective_at: now_ts(),
            expires_at: None,
            admin_pubkey: String::new(),
            signature: String::new(),
        };
        policy.sign(admin).unwrap();
        harness.trust.save(&policy).await.unwrap();
        harness.trust.set_current("p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_event_accepted_and_stored() {
        let harness = harness(RelayMode::Community, AdmissionConfig::default()).await;
        let (client, _rx) = harness.state.register_client();
        let event = torrent_event(&Keys::generate(), &"a".repeat(40));

        let replies = harness.state.handle_text(client, &frame(&event)).await;
        assert_eq!(
            replies,
            vec![RelayMessage::Ok {
                event_id: event.id.clone(),
                accepted: true,
                message: String::new(),
            }]
        );
        assert!(harness
            .state
            .events
            .get_by_id(&event.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_invalid_signature_gets_ok_false() {
        let harness = harness(RelayMode::Community, AdmissionConfig::default()).await;
        let (client, _rx) = harness.state.register_client();
        let mut event = torrent_event(&Keys::generate(), &"a".repeat(40));
        event.sig = "0".repeat(128);

        let replies = harness.state.handle_text(client, &frame(&event)).await;
        match &replies[0] {
            RelayMessage::Ok {
                accepted, message, ..
            } => {
                assert!(!accepted);
                assert_eq!(message, "invalid: bad id or signature");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(harness
            .state
            .events
            .get_by_id(&event.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_community_mode_blocks_foreign_kinds() {
        let harness = harness(RelayMode::Community, AdmissionConfig::default()).await;
        let (client, _rx) = harness.state.register_client();
        let event = Keys::generate()
            .sign(1, vec![], "hello".to_string(), now_ts())
            .unwrap();

        let replies = harness.state.handle_text(client, &frame(&event)).await;
        match &replies[0] {
            RelayMessage::Ok {
                accepted, message, ..
            } => {
                assert!(!accepted);
                assert_eq!(message, "blocked: kind not accepted here");
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        // Public mode accepts the same kind.
        let harness = harness2().await;
        let (client, _rx) = harness.state.register_client();
        let replies = harness.state.handle_text(client, &frame(&event)).await;
        match &replies[0] {
            RelayMessage::Ok { accepted, .. } => assert!(accepted),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    async fn harness2() -> Harness {
        harness(RelayMode::Public, AdmissionConfig::default()).await
    }

    #[tokio::test]
    async fn test_admission_requires_curation_decision() {
        // E4: community mode, require_curation, local curator set {C1},
        // no stored decision.
        let admin = Keys::generate();
        let curator = Keys::generate();
        let mut admission = AdmissionConfig::default();
        admission.require_curation = true;
        admission
            .local_curators
            .insert(curator.public_key_hex().to_string());

        let harness = harness(RelayMode::Community, admission).await;
        approve_curator(&harness, &admin, &curator).await;

        let infohash = format!("{}0003", "c".repeat(36));
        let event = torrent_event(&Keys::generate(), &infohash);

        let (client, _rx) = harness.state.register_client();
        let replies = harness.state.handle_text(client, &frame(&event)).await;
        match &replies[0] {
            RelayMessage::Ok {
                accepted, message, ..
            } => {
                assert!(!accepted);
                assert_eq!(message, "no curation decision found");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        // Not stored, not broadcast.
        assert!(harness
            .state
            .events
            .get_by_id(&event.id)
            .await
            .unwrap()
            .is_none());

        // An accepting decision from the local curator flips the verdict.
        let mut decision = VerificationDecision {
            decision_id: String::new(),
            target_event_id: event.id.clone(),
            target_infohash: infohash.clone(),
            decision: DecisionValue::Accept,
            reason_codes: vec![],
            ruleset_type: None,
            ruleset_version: None,
            ruleset_hash: None,
            curator_pubkey: String::new(),
            signature: String::new(),
            created_at: now_ts(),
            processed_at: None,
            aggregated_decision: None,
        };
        decision.sign(&curator).unwrap();
        harness.decisions.save(&decision).await.unwrap();

        let replies = harness.state.handle_text(client, &frame(&event)).await;
        match &replies[0] {
            RelayMessage::Ok { accepted, .. } => assert!(accepted),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_req_streams_matches_then_eose() {
        let harness = harness(RelayMode::Community, AdmissionConfig::default()).await;
        let (submitter, _srx) = harness.state.register_client();

        let event = torrent_event(&Keys::generate(), &"d".repeat(40));
        harness.state.handle_text(submitter, &frame(&event)).await;

        let (reader, _rrx) = harness.state.register_client();
        let req = ClientMessage::Req {
            subscription_id: "sub-1".to_string(),
            filters: vec![Filter::new().kinds(vec![kinds::TORRENT])],
        }
        .to_json()
        .unwrap();

        let replies = harness.state.handle_text(reader, &req).await;
        assert_eq!(replies.len(), 2);
        assert!(matches!(&replies[0], RelayMessage::Event { subscription_id, .. } if subscription_id == "sub-1"));
        assert!(matches!(&replies[1], RelayMessage::Eose { subscription_id } if subscription_id == "sub-1"));
    }

    #[tokio::test]
    async fn test_live_broadcast_to_matching_subscription() {
        let harness = harness(RelayMode::Community, AdmissionConfig::default()).await;

        let (reader, mut reader_rx) = harness.state.register_client();
        let req = ClientMessage::Req {
            subscription_id: "live".to_string(),
            filters: vec![Filter::new().kinds(vec![kinds::TORRENT])],
        }
        .to_json()
        .unwrap();
        harness.state.handle_text(reader, &req).await;

        let (submitter, _srx) = harness.state.register_client();
        let event = torrent_event(&Keys::generate(), &"e".repeat(40));
        harness.state.handle_text(submitter, &frame(&event)).await;

        let broadcast = reader_rx.try_recv().unwrap();
        match broadcast {
            RelayMessage::Event {
                subscription_id,
                event: received,
            } => {
                assert_eq!(subscription_id, "live");
                assert_eq!(received.id, event.id);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // CLOSE stops the flow.
        let close = ClientMessage::Close {
            subscription_id: "live".to_string(),
        }
        .to_json()
        .unwrap();
        harness.state.handle_text(reader, &close).await;

        let second = torrent_event(&Keys::generate(), &"f".repeat(40));
        harness.state.handle_text(submitter, &frame(&second)).await;
        assert!(reader_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rate_limit_budget() {
        let db = Database::connect_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let pool = db.pool().clone();

        let aggregation = Arc::new(AggregationService::new(
            DecisionStore::new(pool.clone()),
            TrustPolicyStore::new(pool.clone()),
            RulesetStore::new(pool.clone()),
            AggregationPolicy::default(),
        ));
        let server = RelayServer::new(
            RelayServerConfig {
                events_per_minute: 1,
                ..RelayServerConfig::default()
            },
            EventStore::new(pool),
            TorrentAdmissionPolicy::new(AdmissionConfig::default()),
            aggregation,
        );

        let (client, _rx) = server.state.register_client();
        let keys = Keys::generate();

        let first = torrent_event(&keys, &"1".repeat(40));
        let replies = server.state.handle_text(client, &frame(&first)).await;
        assert!(matches!(&replies[0], RelayMessage::Ok { accepted: true, .. }));

        let second = torrent_event(&keys, &"2".repeat(40));
        let replies = server.state.handle_text(client, &frame(&second)).await;
        match &replies[0] {
            RelayMessage::Ok {
                accepted, message, ..
            } => {
                assert!(!accepted);
                assert_eq!(message, "rate-limited: slow down");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_notice() {
        let harness = harness(RelayMode::Community, AdmissionConfig::default()).await;
        let (client, _rx) = harness.state.register_client();

        let replies = harness.state.handle_text(client, "not json").await;
        assert!(matches!(&replies[0], RelayMessage::Notice { .. }));
    }
}
