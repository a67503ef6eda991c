use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::{RwLock, mpsc};

use {
    pincer_agents::AgentRuntime,
    pincer_channels::{ChannelRegistry, InboundBus},
    pincer_config::PincerConfig,
    pincer_protocol::{ClientInfo, HealthSnapshot, PresenceEntry, now_ms},
    pincer_security::{AuditLogger, InputValidator, OriginValidator, RateLimiter, is_loopback_bind},
};

use crate::{auth::ResolvedAuth, nodes::NodeRegistry, stats::GatewayStats};

// ── Settings ─────────────────────────────────────────────────────────────────

/// Connection-engine limits resolved from config.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub bind: String,
    pub port: u16,
    /// Loopback peers bypass the origin allowlist only when this is set.
    pub loopback_only: bool,
    pub allowed_origins: Vec<String>,
    pub max_connections_per_ip: u32,
    pub connection_window: Duration,
    pub messages_per_minute: u32,
    pub message_burst: u32,
    pub max_message_bytes: usize,
    pub max_json_depth: usize,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub tick_interval: Duration,
    pub api_loopback_exempt: bool,
    pub session_sweep_interval: Duration,
    pub audit_capacity: usize,
}

impl GatewaySettings {
    pub fn from_config(config: &PincerConfig) -> Self {
        let gw = &config.gateway;
        Self {
            bind: gw.bind.clone(),
            port: gw.port,
            loopback_only: is_loopback_bind(&gw.bind),
            allowed_origins: gw.allowed_origins.clone(),
            max_connections_per_ip: gw.max_connections_per_ip,
            connection_window: Duration::from_millis(gw.connection_window_ms),
            messages_per_minute: gw.messages_per_minute,
            message_burst: gw.message_burst,
            max_message_bytes: gw.max_message_bytes,
            max_json_depth: gw.max_json_depth,
            handshake_timeout: Duration::from_millis(gw.handshake_timeout_ms),
            ping_interval: Duration::from_millis(gw.ping_interval_ms),
            pong_timeout: Duration::from_millis(gw.pong_timeout_ms),
            tick_interval: Duration::from_millis(gw.tick_interval_ms),
            api_loopback_exempt: config.api.loopback_exempt,
            session_sweep_interval: Duration::from_secs(config.sessions.sweep_interval_secs),
            audit_capacity: config.audit.capacity,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&PincerConfig::default())
    }
}

// ── Connected client ─────────────────────────────────────────────────────────

/// Items queued for a connection's write loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// A WebSocket client currently connected to the gateway.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    /// `cli`, `web`, `mobile`, `node` or `agent`; `unknown` until `connect`.
    pub client_type: String,
    /// Set at most once; nothing clears it for the life of the connection.
    pub authenticated: bool,
    pub subscriptions: HashSet<String>,
    /// Challenge nonce issued on accept.
    pub nonce: Option<String>,
    pub remote_addr: SocketAddr,
    pub client_info: Option<ClientInfo>,
    /// Channel feeding this client's write loop.
    pub sender: mpsc::UnboundedSender<Outbound>,
    pub connected_at: Instant,
    pub connected_at_ms: i64,
    pub last_ping: Instant,
}

impl ConnectedClient {
    pub fn new(
        conn_id: impl Into<String>,
        remote_addr: SocketAddr,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn_id: conn_id.into(),
            client_type: "unknown".into(),
            authenticated: false,
            subscriptions: HashSet::new(),
            nonce: None,
            remote_addr,
            client_info: None,
            sender,
            connected_at: now,
            connected_at_ms: now_ms(),
            last_ping: now,
        }
    }

    /// Send a serialized JSON frame to this client.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(Outbound::Text(frame.to_string())).is_ok()
    }

    /// Whether a broadcast scoped to `topics` reaches this client.
    /// An empty topic list is a global event.
    pub fn wants(&self, topics: &[String]) -> bool {
        topics.is_empty()
            || self.subscriptions.contains("*")
            || topics.iter().any(|t| self.subscriptions.contains(t))
    }

    pub fn presence(&self) -> PresenceEntry {
        PresenceEntry {
            conn_id: self.conn_id.clone(),
            client_type: self.client_type.clone(),
            name: self.client_info.as_ref().map(|c| c.name.clone()),
            remote_addr: Some(self.remote_addr.to_string()),
            connected_at: self.connected_at_ms,
        }
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// All connected WebSocket clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Monotonically increasing sequence counter for broadcast events.
    pub seq: AtomicU64,
    pub version: String,
    pub hostname: String,
    pub auth: ResolvedAuth,
    pub settings: GatewaySettings,
    pub origin: OriginValidator,
    pub input: InputValidator,
    /// Per-IP connection admission.
    pub connection_limiter: RateLimiter,
    /// Per-connection message throughput.
    pub message_limiter: RateLimiter,
    pub audit: AuditLogger,
    pub runtime: Arc<AgentRuntime>,
    pub channels: ChannelRegistry,
    /// Bridges publish inbound messages here.
    pub inbound: InboundBus,
    pub nodes: RwLock<NodeRegistry>,
    pub stats: GatewayStats,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(
        settings: GatewaySettings,
        auth: ResolvedAuth,
        runtime: Arc<AgentRuntime>,
        channels: ChannelRegistry,
        inbound: InboundBus,
    ) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            auth,
            origin: OriginValidator::new(&settings.allowed_origins, settings.loopback_only),
            input: InputValidator::new(settings.max_message_bytes, settings.max_json_depth),
            connection_limiter: RateLimiter::new(
                settings.max_connections_per_ip,
                settings.connection_window,
                settings.max_connections_per_ip,
            ),
            message_limiter: RateLimiter::new(
                settings.messages_per_minute,
                Duration::from_secs(60),
                settings.message_burst,
            ),
            audit: AuditLogger::new(settings.audit_capacity),
            settings,
            runtime,
            channels,
            inbound,
            nodes: RwLock::new(NodeRegistry::new()),
            stats: GatewayStats::new(),
            started_at: Instant::now(),
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Register a new client connection.
    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        let mut clients = self.clients.write().await;
        clients.insert(conn_id, client);
        self.stats.record_active(clients.len());
    }

    /// Remove a client by conn_id. Returns the removed client if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.nodes.write().await.unregister_by_conn(conn_id);
        self.message_limiter.remove(conn_id);
        let mut clients = self.clients.write().await;
        let removed = clients.remove(conn_id);
        self.stats.record_active(clients.len());
        removed
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_authenticated(&self, conn_id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(conn_id)
            .is_some_and(|c| c.authenticated)
    }

    /// Flip `authenticated` on and store client metadata.
    ///
    /// Returns true only on the first successful authentication.
    pub async fn mark_authenticated(&self, conn_id: &str, info: Option<ClientInfo>) -> bool {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.get_mut(conn_id) else {
            return false;
        };
        if let Some(info) = info {
            if !info.mode.is_empty() {
                client.client_type = info.mode.clone();
            }
            client.client_info = Some(info);
        }
        let first = !client.authenticated;
        client.authenticated = true;
        client.nonce = None;
        first
    }

    pub async fn subscribe(&self, conn_id: &str, topics: &[String]) -> Vec<String> {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.get_mut(conn_id) else {
            return Vec::new();
        };
        client.subscriptions.extend(topics.iter().cloned());
        sorted(&client.subscriptions)
    }

    pub async fn unsubscribe(&self, conn_id: &str, topics: &[String]) -> Vec<String> {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.get_mut(conn_id) else {
            return Vec::new();
        };
        if topics.iter().any(|t| t == "*") {
            client.subscriptions.clear();
        } else {
            for t in topics {
                client.subscriptions.remove(t);
            }
        }
        sorted(&client.subscriptions)
    }

    /// Authenticated peers, oldest first.
    pub async fn presence(&self) -> Vec<PresenceEntry> {
        let clients = self.clients.read().await;
        let mut list: Vec<_> = clients
            .values()
            .filter(|c| c.authenticated)
            .map(ConnectedClient::presence)
            .collect();
        list.sort_by_key(|p| p.connected_at);
        list
    }

    pub async fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            sessions: self.runtime.sessions().len().await,
            channels: self.channels.count().await,
            agents: self.runtime.agent_count().await,
            nodes: self.nodes.read().await.count(),
            clients: self.client_count().await,
        }
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<_> = set.iter().cloned().collect();
    v.sort();
    v
}
