//! Per-connection WebSocket engine: admission, challenge, the per-message
//! pipeline, keepalive and cleanup.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    futures::{SinkExt, StreamExt},
    serde::Deserialize,
    thiserror::Error,
    tokio::{sync::mpsc, time::MissedTickBehavior},
    tracing::{debug, info, warn},
};

use {
    pincer_protocol::{
        ConnectParams, ErrorShape, EventFrame, Features, Frame, HelloOk, KNOWN_EVENTS, LegacyFrame,
        Limits, PROTOCOL_VERSION, Policy, RequestFrame, ResponseFrame, ServerInfo, Snapshot,
        close_codes, error_codes, now_ms,
    },
    pincer_security::{AuditEventKind, OriginRejection, ValidationError},
};

use crate::{
    broadcast::broadcast_presence,
    legacy::handle_legacy,
    methods::{CONNECT_METHOD, MethodContext, MethodRegistry},
    nodes::NodeSession,
    state::{ConnectedClient, GatewayState, Outbound},
    stats::Rejection,
};

// ── Admission ────────────────────────────────────────────────────────────────

/// Terminal refusal of a new connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error(transparent)]
    Origin(#[from] OriginRejection),
    #[error("too many connections from {ip}")]
    TooManyConnections { ip: String, retry_after: Duration },
}

impl AdmissionError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Origin(_) => close_codes::ORIGIN_REJECTED,
            Self::TooManyConnections { .. } => close_codes::TOO_MANY_CONNECTIONS,
        }
    }
}

/// Origin first, then the per-IP connection bucket. Every refusal is audited.
pub fn admit(
    state: &GatewayState,
    origin: Option<&str>,
    remote: SocketAddr,
) -> Result<(), AdmissionError> {
    let ip = remote.ip().to_string();
    if let Err(e) = state.origin.validate(origin, remote.ip()) {
        state.stats.record_rejection(Rejection::Origin);
        state.audit.record(
            AuditEventKind::OriginRejected,
            ip.as_str(),
            serde_json::json!({ "origin": origin, "reason": e.to_string() }),
        );
        return Err(e.into());
    }
    if let Err(e) = state.connection_limiter.check(&ip) {
        state.stats.record_rejection(Rejection::ConnectionRate);
        state.audit.record(
            AuditEventKind::ConnectionRateLimited,
            ip.as_str(),
            serde_json::json!({ "retryAfterMs": millis(e.retry_after()) }),
        );
        return Err(AdmissionError::TooManyConnections {
            ip,
            retry_after: e.retry_after(),
        });
    }
    Ok(())
}

// ── Outbound helpers ─────────────────────────────────────────────────────────

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn send_json<T: serde::Serialize>(tx: &mpsc::UnboundedSender<Outbound>, frame: &T) {
    if let Ok(text) = serde_json::to_string(frame) {
        let _ = tx.send(Outbound::Text(text));
    }
}

const MAX_CLOSE_REASON_BYTES: usize = 123;

fn send_close(tx: &mpsc::UnboundedSender<Outbound>, code: u16, reason: &str) {
    let mut end = reason.len().min(MAX_CLOSE_REASON_BYTES);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let _ = tx.send(Outbound::Close {
        code,
        reason: reason[..end].to_string(),
    });
}

/// Reply to a frame that failed before dispatch. RPC requests get a `res`
/// with their id; everything else gets a legacy `error` frame.
fn send_error_frame(
    tx: &mpsc::UnboundedSender<Outbound>,
    kind: Option<&str>,
    id: Option<String>,
    error: ErrorShape,
) {
    match (kind, id) {
        (Some("req"), Some(id)) => send_json(tx, &ResponseFrame::err(id, error)),
        (_, id) => send_json(tx, &LegacyFrame::from_error_shape(id, &error)),
    }
}

fn send_rejection(
    tx: &mpsc::UnboundedSender<Outbound>,
    value: Option<&serde_json::Value>,
    error: ErrorShape,
) {
    let kind = value.and_then(|v| v.get("type")).and_then(|v| v.as_str());
    let id = value
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    send_error_frame(tx, kind, id, error);
}

/// The `type` tag and `id` of a frame, read without building a `Value`.
#[derive(Debug, Default, Deserialize)]
struct FrameHead {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

impl FrameHead {
    fn peek(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }
}

fn validation_shape(err: &ValidationError) -> ErrorShape {
    let code = match err {
        ValidationError::TooLarge { .. } => error_codes::PAYLOAD_TOO_LARGE,
        ValidationError::Malformed(_) => error_codes::PARSE_ERROR,
        _ => error_codes::INVALID_REQUEST,
    };
    ErrorShape::new(code, err.to_string())
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        let msg = match item {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Ping => Message::Ping(Default::default()),
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            },
        };
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

// ── Connection lifecycle ─────────────────────────────────────────────────────

/// Drive one upgraded socket from admission to cleanup.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: SocketAddr,
    origin: Option<String>,
    query_token: Option<String>,
) {
    let (sink, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let mut writer = tokio::spawn(write_loop(sink, rx));

    if let Err(e) = admit(&state, origin.as_deref(), remote_addr) {
        warn!(remote = %remote_addr, code = e.close_code(), error = %e, "connection refused");
        send_close(&tx, e.close_code(), &e.to_string());
        drop(tx);
        let _ = writer.await;
        return;
    }

    let conn_id = uuid::Uuid::new_v4().to_string();
    let nonce = uuid::Uuid::new_v4().to_string();
    state.stats.record_connection();
    state.audit.record(
        AuditEventKind::ConnectionAccepted,
        conn_id.as_str(),
        serde_json::json!({ "remote": remote_addr.to_string(), "origin": origin }),
    );

    let mut client = ConnectedClient::new(&conn_id, remote_addr, tx.clone());
    client.nonce = Some(nonce.clone());
    state.register_client(client).await;

    // Mode `none` authorizes anything; otherwise only a valid `?token=`.
    let pre_authenticated = state.auth.authorize_bearer(query_token.as_deref()).is_ok();
    if pre_authenticated {
        state.mark_authenticated(&conn_id, None).await;
    }
    info!(conn_id = %conn_id, remote = %remote_addr, pre_authenticated, "ws: new connection");

    send_json(
        &tx,
        &EventFrame::unsequenced(
            "connect.challenge",
            serde_json::json!({ "nonce": nonce, "ts": now_ms() }),
        ),
    );
    send_json(
        &tx,
        &LegacyFrame::new(
            "connected",
            None,
            serde_json::json!({
                "connId": conn_id,
                "nonce": nonce,
                "authenticated": pre_authenticated,
                "protocol": PROTOCOL_VERSION,
            }),
        ),
    );

    if pre_authenticated {
        broadcast_presence(&state, &conn_id, "joined").await;
    }

    // Frames that pass the cheap checks are handled in arrival order by a
    // worker, so a slow turn never stalls keepalive.
    let (work_tx, work_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(dispatch_loop(
        Arc::clone(&state),
        Arc::clone(&methods),
        conn_id.clone(),
        tx.clone(),
        work_rx,
    ));

    let settings = state.settings.clone();
    let mut ping = tokio::time::interval(settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;
    let handshake = tokio::time::sleep(settings.handshake_timeout);
    tokio::pin!(handshake);
    let mut awaiting_auth = !pre_authenticated;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if admit_message(&state, &conn_id, &tx, text.as_str()) {
                            let _ = work_tx.send(text.as_str().to_string());
                        }
                    },
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        if let Some(c) = state.clients.write().await.get_mut(&conn_id) {
                            c.last_ping = last_pong;
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        send_rejection(&tx, None, ErrorShape::new(
                            error_codes::INVALID_REQUEST,
                            "binary frames are not supported",
                        ));
                    },
                    Some(Ok(Message::Ping(_))) => {},
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id = %conn_id, error = %e, "ws: read error");
                        break;
                    },
                }
            },
            _ = ping.tick() => {
                if last_pong.elapsed() > settings.pong_timeout {
                    warn!(conn_id = %conn_id, "ws: pong timeout");
                    state.stats.record_rejection(Rejection::PongTimeout);
                    send_close(&tx, close_codes::PONG_TIMEOUT, "pong timeout");
                    break;
                }
                let _ = tx.send(Outbound::Ping);
            },
            _ = &mut handshake, if awaiting_auth => {
                if state.is_authenticated(&conn_id).await {
                    awaiting_auth = false;
                    continue;
                }
                warn!(conn_id = %conn_id, remote = %remote_addr, "ws: handshake timeout");
                state.stats.record_rejection(Rejection::HandshakeTimeout);
                state.audit.record(
                    AuditEventKind::HandshakeTimeout,
                    conn_id.as_str(),
                    serde_json::json!({ "remote": remote_addr.to_string() }),
                );
                send_close(&tx, close_codes::HANDSHAKE_TIMEOUT, "authentication timeout");
                break;
            },
        }
    }

    // Cleanup. An in-flight turn finishes; queued frames find the client gone.
    drop(work_tx);
    let removed = state.remove_client(&conn_id).await;
    let was_authenticated = removed.as_ref().is_some_and(|c| c.authenticated);
    let duration_ms = removed
        .as_ref()
        .map(|c| millis(c.connected_at.elapsed()))
        .unwrap_or_default();
    drop(removed);
    state.audit.record(
        AuditEventKind::ConnectionClosed,
        conn_id.as_str(),
        serde_json::json!({ "durationMs": duration_ms }),
    );
    if was_authenticated {
        broadcast_presence(&state, &conn_id, "left").await;
    }
    info!(conn_id = %conn_id, duration_ms, "ws: connection closed");

    drop(tx);
    if tokio::time::timeout(Duration::from_secs(1), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

// ── Per-message pipeline ─────────────────────────────────────────────────────

/// Steps 1 and 2 of the pipeline, run on the read loop. Returns true when
/// the frame may be queued for dispatch.
fn admit_message(
    state: &GatewayState,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    text: &str,
) -> bool {
    // 1. Raw length, before any parsing.
    if let Err(e) = state.input.check_length(text) {
        reject_input(state, conn_id, tx, None, &e);
        return false;
    }

    // 2. Per-connection throughput.
    if let Err(e) = state.message_limiter.check(conn_id) {
        let retry_ms = millis(e.retry_after());
        state.stats.record_message_rejected(true);
        state.audit.record(
            AuditEventKind::MessageRateLimited,
            conn_id,
            serde_json::json!({ "retryAfterMs": retry_ms }),
        );
        let head = FrameHead::peek(text);
        send_error_frame(
            tx,
            head.kind.as_deref(),
            head.id,
            ErrorShape::rate_limited(retry_ms),
        );
        return false;
    }
    true
}

async fn dispatch_loop(
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    conn_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = rx.recv().await {
        process_text(&state, &methods, &conn_id, &tx, &text).await;
    }
}

/// Steps 3 to 5: parse, structure, dispatch.
async fn process_text(
    state: &Arc<GatewayState>,
    methods: &MethodRegistry,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    text: &str,
) {
    // 3. Parse.
    let value = match state.input.parse(text) {
        Ok(v) => v,
        Err(e) => {
            reject_input(state, conn_id, tx, None, &e);
            return;
        },
    };

    // 4. Structure.
    if let Err(e) = state.input.validate_frame(&value) {
        reject_input(state, conn_id, tx, Some(&value), &e);
        return;
    }

    // 5. Dispatch.
    let frame = match Frame::from_value(value.clone()) {
        Ok(f) => f,
        Err(e) => {
            send_rejection(
                tx,
                Some(&value),
                ErrorShape::new(error_codes::INVALID_REQUEST, format!("invalid frame: {e}")),
            );
            return;
        },
    };
    match frame {
        Frame::Request(req) => {
            state.stats.record_message("rpc");
            let res = handle_rpc(state, methods, conn_id, req).await;
            send_json(tx, &res);
        },
        Frame::Legacy(legacy) => {
            state.stats.record_message("legacy");
            let res = handle_legacy(state, conn_id, legacy).await;
            send_json(tx, &res);
        },
        Frame::Response(_) | Frame::Event(_) => {
            send_rejection(
                tx,
                Some(&value),
                ErrorShape::new(error_codes::INVALID_REQUEST, "clients may only send requests"),
            );
        },
    }
}

fn reject_input(
    state: &GatewayState,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    value: Option<&serde_json::Value>,
    err: &ValidationError,
) {
    state.stats.record_message_rejected(false);
    state.audit.record(
        AuditEventKind::InputRejected,
        conn_id,
        serde_json::json!({ "reason": err.to_string() }),
    );
    send_rejection(tx, value, validation_shape(err));
}

// ── RPC ──────────────────────────────────────────────────────────────────────

async fn handle_rpc(
    state: &Arc<GatewayState>,
    methods: &MethodRegistry,
    conn_id: &str,
    req: RequestFrame,
) -> ResponseFrame {
    if req.method == CONNECT_METHOD {
        return handle_connect(state, methods, conn_id, req).await;
    }
    if !state.is_authenticated(conn_id).await {
        debug!(conn_id, method = %req.method, "rpc before auth");
        return ResponseFrame::err(&req.id, ErrorShape::not_authenticated());
    }
    let params = req.params_or_empty();
    methods
        .dispatch(MethodContext {
            request_id: req.id,
            method: req.method,
            params,
            client_conn_id: conn_id.to_string(),
            state: Arc::clone(state),
        })
        .await
}

async fn handle_connect(
    state: &Arc<GatewayState>,
    methods: &MethodRegistry,
    conn_id: &str,
    req: RequestFrame,
) -> ResponseFrame {
    let params: ConnectParams = match serde_json::from_value(req.params_or_empty()) {
        Ok(p) => p,
        Err(e) => {
            return ResponseFrame::err(
                &req.id,
                ErrorShape::invalid_params(format!("invalid connect params: {e}")),
            );
        },
    };

    let min = params.min_protocol.unwrap_or(PROTOCOL_VERSION);
    let max = params.max_protocol.unwrap_or(PROTOCOL_VERSION);
    if !(min..=max).contains(&PROTOCOL_VERSION) {
        return ResponseFrame::err(
            &req.id,
            ErrorShape::new(error_codes::INVALID_REQUEST, "protocol mismatch").with_details(
                serde_json::json!({ "expectedProtocol": PROTOCOL_VERSION }),
            ),
        );
    }

    let auth = params.auth.clone().unwrap_or_default();
    let method = match state
        .auth
        .authorize_connect(auth.token.as_deref(), auth.password.as_deref())
    {
        Ok(m) => m,
        Err(e) => {
            state.stats.record_auth(false);
            state.audit.record(
                AuditEventKind::AuthFailure,
                conn_id,
                serde_json::json!({ "reason": e.reason() }),
            );
            warn!(conn_id, reason = %e.reason(), "ws: connect auth failed");
            return ResponseFrame::err(
                &req.id,
                ErrorShape::new(error_codes::UNAUTHORIZED, e.to_string()),
            );
        },
    };

    state.stats.record_auth(true);
    state.audit.record(
        AuditEventKind::AuthSuccess,
        conn_id,
        serde_json::json!({ "method": method.as_str() }),
    );
    let first = state.mark_authenticated(conn_id, params.client.clone()).await;

    if let Some(client) = params.client.as_ref().filter(|c| c.mode == "node") {
        let remote_ip = state
            .clients
            .read()
            .await
            .get(conn_id)
            .map(|c| c.remote_addr.ip().to_string());
        let node_id = if client.name.is_empty() {
            conn_id.to_string()
        } else {
            client.name.clone()
        };
        state.nodes.write().await.register(NodeSession {
            node_id,
            conn_id: conn_id.to_string(),
            display_name: Some(client.name.clone()).filter(|n| !n.is_empty()),
            platform: client.platform.clone(),
            version: client.version.clone(),
            remote_ip,
            connected_at: now_ms(),
        });
    }

    if first {
        info!(
            conn_id,
            method = method.as_str(),
            client = params.client.as_ref().map(|c| c.name.as_str()).unwrap_or(""),
            "ws: client authenticated"
        );
        broadcast_presence(state, conn_id, "joined").await;
    }

    let hello = HelloOk {
        r#type: "hello-ok".into(),
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: state.version.clone(),
            host: Some(state.hostname.clone()),
            conn_id: conn_id.to_string(),
        },
        features: Features {
            methods: methods.method_names(),
            events: KNOWN_EVENTS.iter().map(|e| e.to_string()).collect(),
        },
        snapshot: Snapshot {
            presence: state.presence().await,
            health: state.health_snapshot().await,
        },
        limits: Limits {
            max_payload: state.settings.max_message_bytes,
            max_json_depth: state.settings.max_json_depth,
            messages_per_minute: state.settings.messages_per_minute,
            message_burst: state.settings.message_burst,
            tick_interval_ms: millis(state.settings.tick_interval),
            ping_interval_ms: millis(state.settings.ping_interval),
        },
        policy: Policy {
            auth_mode: state.auth.mode.as_str().to_string(),
            loopback_only: state.settings.loopback_only,
            require_approval: state
                .runtime
                .tools()
                .global_policy()
                .require_approval
                .clone(),
        },
    };
    match serde_json::to_value(&hello) {
        Ok(payload) => ResponseFrame::ok(&req.id, payload),
        Err(_) => ResponseFrame::err(&req.id, ErrorShape::internal()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn admission_close_codes() {
        let origin = AdmissionError::Origin(OriginRejection::NotAllowed {
            origin: "https://evil.example".into(),
        });
        assert_eq!(origin.close_code(), 4003);
        let rate = AdmissionError::TooManyConnections {
            ip: "127.0.0.1".into(),
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(rate.close_code(), 4029);
    }

    #[test]
    fn rejection_follows_dialect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = serde_json::json!({"type": "req", "id": "7", "method": "x"});
        send_rejection(&tx, Some(&req), ErrorShape::rate_limited(1000));
        let Some(Outbound::Text(text)) = rx.try_recv().ok() else {
            panic!("expected text frame");
        };
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "res");
        assert_eq!(v["id"], "7");
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], 429);

        send_rejection(&tx, None, validation_shape(&ValidationError::NotAnObject));
        let Some(Outbound::Text(text)) = rx.try_recv().ok() else {
            panic!("expected text frame");
        };
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["payload"]["code"], error_codes::INVALID_REQUEST);
    }

    #[test]
    fn frame_head_keeps_request_id_for_rate_limit_reply() {
        let head = FrameHead::peek(r#"{"type":"req","id":"9","method":"health","params":{}}"#);
        assert_eq!(head.kind.as_deref(), Some("req"));
        assert_eq!(head.id.as_deref(), Some("9"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        send_error_frame(&tx, head.kind.as_deref(), head.id, ErrorShape::rate_limited(250));
        let Some(Outbound::Text(text)) = rx.try_recv().ok() else {
            panic!("expected text frame");
        };
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "res");
        assert_eq!(v["id"], "9");
        assert_eq!(v["error"]["code"], 429);

        // Garbage or a numeric id falls back to an empty head.
        let head = FrameHead::peek("not json");
        assert!(head.kind.is_none() && head.id.is_none());
        let head = FrameHead::peek(r#"{"type":"req","id":5}"#);
        assert!(head.kind.is_none());
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn close_reason_is_truncated() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        send_close(&tx, 4003, &"x".repeat(300));
        let Some(Outbound::Close { code, reason }) = rx.try_recv().ok() else {
            panic!("expected close");
        };
        assert_eq!(code, 4003);
        assert_eq!(reason.len(), 123);

        send_close(&tx, 4003, &"é".repeat(100));
        let Some(Outbound::Close { reason, .. }) = rx.try_recv().ok() else {
            panic!("expected close");
        };
        assert_eq!(reason.len(), 122);
    }
}
