use std::collections::VecDeque;

use {
    chrono::{DateTime, Utc},
    parking_lot::Mutex,
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// Category of a recorded security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    ConnectionAccepted,
    ConnectionClosed,
    OriginRejected,
    ConnectionRateLimited,
    MessageRateLimited,
    HandshakeTimeout,
    AuthSuccess,
    AuthFailure,
    ApiAuthFailure,
    InputRejected,
    ToolApprovalRequired,
    ToolExecuted,
    SessionEvicted,
}

impl AuditEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionAccepted => "connection_accepted",
            Self::ConnectionClosed => "connection_closed",
            Self::OriginRejected => "origin_rejected",
            Self::ConnectionRateLimited => "connection_rate_limited",
            Self::MessageRateLimited => "message_rate_limited",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
            Self::ApiAuthFailure => "api_auth_failure",
            Self::InputRejected => "input_rejected",
            Self::ToolApprovalRequired => "tool_approval_required",
            Self::ToolExecuted => "tool_executed",
            Self::SessionEvicted => "session_evicted",
        }
    }

    /// Whether the event denotes something that was refused.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            Self::OriginRejected
                | Self::ConnectionRateLimited
                | Self::MessageRateLimited
                | Self::HandshakeTimeout
                | Self::AuthFailure
                | Self::ApiAuthFailure
                | Self::InputRejected
                | Self::ToolApprovalRequired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: uuid::Uuid,
    #[serde(rename = "type")]
    pub kind: AuditEventKind,
    /// Remote address, connection id or component that triggered the event.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, source: impl Into<String>, details: serde_json::Value) -> Self {
        let details = match details {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                map
            },
        };
        Self {
            id: uuid::Uuid::new_v4(),
            kind,
            source: source.into(),
            timestamp: Utc::now(),
            details,
        }
    }
}

struct Ring {
    events: VecDeque<AuditEvent>,
    total: u64,
}

/// Fixed-capacity in-memory audit trail. Oldest events are overwritten.
pub struct AuditLogger {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity),
                total: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, kind: AuditEventKind, source: impl Into<String>, details: serde_json::Value) {
        self.push(AuditEvent::new(kind, source, details));
    }

    pub fn push(&self, event: AuditEvent) {
        if event.kind.is_rejection() {
            warn!(target: "audit", kind = event.kind.as_str(), source = %event.source, details = ?event.details, "security event");
        } else {
            info!(target: "audit", kind = event.kind.as_str(), source = %event.source, "security event");
        }

        let mut ring = self.ring.lock();
        ring.total += 1;
        if self.capacity == 0 {
            return;
        }
        if ring.events.len() == self.capacity {
            ring.events.pop_front();
        }
        ring.events.push_back(event);
    }

    /// The last `n` events, oldest first. Does not mutate the buffer.
    pub fn get_recent(&self, n: usize) -> Vec<AuditEvent> {
        let ring = self.ring.lock();
        let skip = ring.events.len().saturating_sub(n);
        ring.events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events recorded since startup, including overwritten ones.
    pub fn total_recorded(&self) -> u64 {
        self.ring.lock().total
    }
}
