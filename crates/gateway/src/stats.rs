//! In-process counters behind `/api/stats` and `/api/metrics`.
//!
//! Each recorder also feeds the `metrics` facade so an exporter installed by
//! the embedding binary sees the same numbers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct GatewayStats {
    connections_total: AtomicU64,
    rejected_origin: AtomicU64,
    rejected_rate: AtomicU64,
    handshake_timeouts: AtomicU64,
    pong_timeouts: AtomicU64,
    auth_successes: AtomicU64,
    auth_failures: AtomicU64,
    messages_total: AtomicU64,
    messages_rejected: AtomicU64,
    messages_rate_limited: AtomicU64,
    rpc_requests: AtomicU64,
    legacy_messages: AtomicU64,
    upstream_errors: AtomicU64,
    broadcasts: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub rejected_origin: u64,
    pub rejected_rate: u64,
    pub handshake_timeouts: u64,
    pub pong_timeouts: u64,
    pub auth_successes: u64,
    pub auth_failures: u64,
    pub messages_total: u64,
    pub messages_rejected: u64,
    pub messages_rate_limited: u64,
    pub rpc_requests: u64,
    pub legacy_messages: u64,
    pub upstream_errors: u64,
    pub broadcasts: u64,
}

/// Why an admission or message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Origin,
    ConnectionRate,
    HandshakeTimeout,
    PongTimeout,
}

impl Rejection {
    fn label(self) -> &'static str {
        match self {
            Self::Origin => "origin",
            Self::ConnectionRate => "rate_limit",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::PongTimeout => "pong_timeout",
        }
    }
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pincer_ws_connections_total").increment(1);
    }

    pub fn record_rejection(&self, why: Rejection) {
        let counter = match why {
            Rejection::Origin => &self.rejected_origin,
            Rejection::ConnectionRate => &self.rejected_rate,
            Rejection::HandshakeTimeout => &self.handshake_timeouts,
            Rejection::PongTimeout => &self.pong_timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pincer_ws_rejected_total", "reason" => why.label()).increment(1);
    }

    pub fn record_active(&self, active: usize) {
        metrics::gauge!("pincer_ws_connections_active").set(active as f64);
    }

    pub fn record_auth(&self, ok: bool) {
        if ok {
            self.auth_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `dialect` is `rpc` or `legacy`.
    pub fn record_message(&self, dialect: &'static str) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        match dialect {
            "rpc" => self.rpc_requests.fetch_add(1, Ordering::Relaxed),
            _ => self.legacy_messages.fetch_add(1, Ordering::Relaxed),
        };
        metrics::counter!("pincer_messages_total", "dialect" => dialect).increment(1);
    }

    pub fn record_message_rejected(&self, rate_limited: bool) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
        if rate_limited {
            self.messages_rate_limited.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Provider failure surfaced to a client. The runtime emits its own metric.
    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A bridge failed to deliver an outbound message.
    pub fn record_delivery_failure(&self, channel: &str) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pincer_channel_send_errors_total", "channel" => channel.to_string())
            .increment(1);
    }

    pub fn record_broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_total: load(&self.connections_total),
            rejected_origin: load(&self.rejected_origin),
            rejected_rate: load(&self.rejected_rate),
            handshake_timeouts: load(&self.handshake_timeouts),
            pong_timeouts: load(&self.pong_timeouts),
            auth_successes: load(&self.auth_successes),
            auth_failures: load(&self.auth_failures),
            messages_total: load(&self.messages_total),
            messages_rejected: load(&self.messages_rejected),
            messages_rate_limited: load(&self.messages_rate_limited),
            rpc_requests: load(&self.rpc_requests),
            legacy_messages: load(&self.legacy_messages),
            upstream_errors: load(&self.upstream_errors),
            broadcasts: load(&self.broadcasts),
        }
    }
}
