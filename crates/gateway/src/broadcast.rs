use std::sync::Arc;

use tracing::debug;

use pincer_protocol::{EventFrame, now_ms};

use crate::state::GatewayState;

/// Delivery options for a broadcast event.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOpts {
    /// Topics the event belongs to (channel name, session id). Empty means
    /// every authenticated client receives it; otherwise only clients
    /// subscribed to one of the topics or to `*`.
    pub topics: Vec<String>,
    /// Skip this connection (usually the originator, who got a direct reply).
    pub exclude: Option<String>,
}

impl BroadcastOpts {
    pub fn topics(topics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            exclude: None,
        }
    }

    pub fn excluding(mut self, conn_id: impl Into<String>) -> Self {
        self.exclude = Some(conn_id.into());
        self
    }
}

/// Send a sequenced event to every authenticated client that wants it.
/// Returns the number of clients the frame was queued for.
pub async fn broadcast(
    state: &Arc<GatewayState>,
    event: &str,
    payload: serde_json::Value,
    opts: BroadcastOpts,
) -> usize {
    let frame = EventFrame::new(event, payload, state.next_seq());
    let Ok(json) = serde_json::to_string(&frame) else {
        return 0;
    };

    let clients = state.clients.read().await;
    let mut delivered = 0;
    for client in clients.values() {
        if !client.authenticated || opts.exclude.as_deref() == Some(client.conn_id.as_str()) {
            continue;
        }
        if client.wants(&opts.topics) && client.send(&json) {
            delivered += 1;
        }
    }
    state.stats.record_broadcast();
    debug!(event, delivered, "broadcast");
    delivered
}

pub async fn broadcast_tick(state: &Arc<GatewayState>) {
    broadcast(
        state,
        "tick",
        serde_json::json!({ "ts": now_ms() }),
        BroadcastOpts::default(),
    )
    .await;
}

/// Announce the current presence list after a join or leave. The peer that
/// changed is skipped; a joiner gets presence in its `hello-ok` snapshot.
pub async fn broadcast_presence(state: &Arc<GatewayState>, conn_id: &str, change: &str) {
    let presence = state.presence().await;
    broadcast(
        state,
        "presence",
        serde_json::json!({
            "change": change,
            "connId": conn_id,
            "presence": presence,
        }),
        BroadcastOpts::default().excluding(conn_id),
    )
    .await;
}
