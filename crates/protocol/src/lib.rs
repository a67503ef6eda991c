//! Gateway WebSocket protocol definitions.
//!
//! Two dialects share one socket:
//! - RPC frames: `RequestFrame` (`type:"req"`), `ResponseFrame` (`type:"res"`)
//!   and `EventFrame` (`type:"event"`).
//! - Legacy frames: `{type, id, timestamp, payload}` where responses echo the
//!   original type with a `:response` suffix and failures use `type:"error"`.

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 3;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB
pub const MAX_JSON_DEPTH: usize = 32;
pub const TICK_INTERVAL_MS: u64 = 30_000;
pub const PING_INTERVAL_MS: u64 = 25_000;
pub const PONG_TIMEOUT_MS: u64 = 75_000;
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Suffix appended to a legacy request type to form its response type.
pub const LEGACY_RESPONSE_SUFFIX: &str = ":response";

// ── Close codes ──────────────────────────────────────────────────────────────

pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const PONG_TIMEOUT: u16 = 4000;
    pub const ORIGIN_REJECTED: u16 = 4003;
    pub const HANDSHAKE_TIMEOUT: u16 = 4008;
    pub const TOO_MANY_CONNECTIONS: u16 = 4029;
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    // JSON-RPC style
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;

    // HTTP style
    pub const UNAUTHORIZED: i64 = 401;
    pub const FORBIDDEN: i64 = 403;
    pub const NOT_FOUND: i64 = 404;
    pub const PAYLOAD_TOO_LARGE: i64 = 413;
    pub const APPROVAL_REQUIRED: i64 = 428;
    pub const RATE_LIMITED: i64 = 429;
    pub const UNAVAILABLE: i64 = 503;
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn not_authenticated() -> Self {
        Self::new(
            error_codes::UNAUTHORIZED,
            "Not authenticated. Send a connect request first.",
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("unknown method: {method}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::SERVER_ERROR, message)
    }

    /// Generic failure that hides upstream detail from the client.
    pub fn internal() -> Self {
        Self::new(error_codes::INTERNAL, "internal error")
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            retryable: Some(true),
            retry_after_ms: Some(retry_after_ms),
            ..Self::new(error_codes::RATE_LIMITED, "rate limit exceeded")
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ── RPC frames ───────────────────────────────────────────────────────────────

/// Client → gateway RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // always "req"
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Params or an empty object when omitted.
    pub fn params_or_empty(&self) -> serde_json::Value {
        self.params
            .clone()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

/// Gateway → client RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "event"
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
        }
    }

    /// Event sent outside the broadcast sequence (handshake, per-client notices).
    pub fn unsequenced(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: None,
        }
    }
}

// ── Legacy frames ────────────────────────────────────────────────────────────

/// Type-tagged frame from the pre-RPC dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyFrame {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl LegacyFrame {
    pub fn new(kind: impl Into<String>, id: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: kind.into(),
            id,
            timestamp: now_ms(),
            payload,
        }
    }

    /// Response to a legacy request of type `kind`.
    pub fn response(kind: &str, id: Option<String>, payload: serde_json::Value) -> Self {
        Self::new(format!("{kind}{LEGACY_RESPONSE_SUFFIX}"), id, payload)
    }

    pub fn error(id: Option<String>, code: i64, message: impl Into<String>) -> Self {
        Self::new(
            "error",
            id,
            serde_json::json!({ "message": message.into(), "code": code }),
        )
    }

    pub fn from_error_shape(id: Option<String>, error: &ErrorShape) -> Self {
        let mut frame = Self::error(id, error.code, error.message.clone());
        if let Some(retry) = error.retry_after_ms {
            frame.payload["retryAfterMs"] = serde_json::json!(retry);
        }
        frame
    }
}

// ── Frame union ──────────────────────────────────────────────────────────────

/// Any frame that can appear on the wire.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(EventFrame),
    Legacy(LegacyFrame),
}

impl Frame {
    /// Classify a parsed JSON object by its `type` tag.
    ///
    /// `req`, `res` and `event` select the RPC dialect; every other type
    /// string is a legacy message.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(match kind.as_str() {
            "req" => Frame::Request(serde_json::from_value(value)?),
            "res" => Frame::Response(serde_json::from_value(value)?),
            "event" => Frame::Event(serde_json::from_value(value)?),
            _ => Frame::Legacy(serde_json::from_value(value)?),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Frame::Request(f) => serde_json::to_string(f),
            Frame::Response(f) => serde_json::to_string(f),
            Frame::Event(f) => serde_json::to_string(f),
            Frame::Legacy(f) => serde_json::to_string(f),
        }
    }
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Params of the `connect` RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    #[serde(rename = "minProtocol", default, skip_serializing_if = "Option::is_none")]
    pub min_protocol: Option<u32>,
    #[serde(rename = "maxProtocol", default, skip_serializing_if = "Option::is_none")]
    pub max_protocol: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub name: String,
    /// One of `cli`, `web`, `mobile`, `node`, `agent`.
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Payload of a successful `connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    pub r#type: String, // always "hello-ok"
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub snapshot: Snapshot,
    pub limits: Limits,
    pub policy: Policy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "connId")]
    pub conn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub presence: Vec<PresenceEntry>,
    pub health: HealthSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    #[serde(rename = "connId")]
    pub conn_id: String,
    #[serde(rename = "clientType")]
    pub client_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "remoteAddr", skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(rename = "connectedAt")]
    pub connected_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub sessions: usize,
    pub channels: usize,
    pub agents: usize,
    pub nodes: usize,
    pub clients: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "maxJsonDepth")]
    pub max_json_depth: usize,
    #[serde(rename = "messagesPerMinute")]
    pub messages_per_minute: u32,
    #[serde(rename = "messageBurst")]
    pub message_burst: u32,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
    #[serde(rename = "pingIntervalMs")]
    pub ping_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "authMode")]
    pub auth_mode: String,
    #[serde(rename = "loopbackOnly")]
    pub loopback_only: bool,
    #[serde(rename = "requireApproval")]
    pub require_approval: Vec<String>,
}

// ── Known events ─────────────────────────────────────────────────────────────

pub const KNOWN_EVENTS: &[&str] = &[
    "connect.challenge",
    "tick",
    "shutdown",
    "presence",
    "chat",
    "session.ended",
    "tool.approval.required",
];

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
