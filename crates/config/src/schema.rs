/// Config schema types (gateway, api, sessions, agents, tools, audit, provider).
use {
    pincer_agents::AgentConfig,
    secrecy::Secret,
    serde::{Deserialize, Serialize},
};

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 18789;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PincerConfig {
    pub gateway: GatewayConfig,
    pub api: ApiConfig,
    pub sessions: SessionsConfig,
    pub agents: AgentsConfig,
    pub tools: ToolsConfig,
    pub audit: AuditConfig,
    pub provider: ProviderConfig,
}

// ── Gateway ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    Token,
    Password,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Token => "token",
            Self::Password => "password",
        }
    }
}

/// Secrets are never written back out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Explicit mode. When unset it is inferred from which secret is present.
    pub mode: Option<AuthMode>,
    #[serde(skip_serializing)]
    pub token: Option<Secret<String>>,
    #[serde(skip_serializing)]
    pub password: Option<Secret<String>>,
}

impl AuthConfig {
    pub fn resolved_mode(&self) -> AuthMode {
        if let Some(mode) = self.mode {
            return mode;
        }
        if self.password.is_some() {
            AuthMode::Password
        } else if self.token.is_some() {
            AuthMode::Token
        } else {
            AuthMode::None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    pub auth: AuthConfig,
    /// Exact `scheme://host[:port]` origins accepted on the WebSocket handshake.
    pub allowed_origins: Vec<String>,
    pub max_connections_per_ip: u32,
    pub connection_window_ms: u64,
    pub messages_per_minute: u32,
    pub message_burst: u32,
    pub max_message_bytes: usize,
    pub max_json_depth: usize,
    pub handshake_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.into(),
            port: DEFAULT_PORT,
            auth: AuthConfig::default(),
            allowed_origins: Vec::new(),
            max_connections_per_ip: 20,
            connection_window_ms: 60_000,
            messages_per_minute: 120,
            message_burst: 30,
            max_message_bytes: pincer_protocol::MAX_PAYLOAD_BYTES,
            max_json_depth: pincer_protocol::MAX_JSON_DEPTH,
            handshake_timeout_ms: pincer_protocol::HANDSHAKE_TIMEOUT_MS,
            ping_interval_ms: pincer_protocol::PING_INTERVAL_MS,
            pong_timeout_ms: pincer_protocol::PONG_TIMEOUT_MS,
            tick_interval_ms: pincer_protocol::TICK_INTERVAL_MS,
        }
    }
}

// ── HTTP API ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiConfig {
    /// Skip bearer auth for requests from 127.0.0.0/8 and ::1.
    pub loopback_exempt: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            loopback_exempt: true,
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionsConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_context_messages: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
            max_context_messages: pincer_sessions::session::DEFAULT_MAX_CONTEXT_MESSAGES,
        }
    }
}

// ── Agents ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentsConfig {
    pub default: Option<String>,
    pub list: Vec<AgentConfig>,
}

// ── Tools ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolsConfig {
    /// Gateway-wide approval list; entries may end in `*`.
    pub require_approval: Vec<String>,
    pub exec: ExecConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
    pub require_approval: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30,
            max_output_bytes: 64 * 1024,
            require_approval: true,
        }
    }
}

// ── Audit / provider ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditConfig {
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: pincer_security::audit::DEFAULT_AUDIT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
        }
    }
}
