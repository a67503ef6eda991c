#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, Stream, StreamExt},
    secrecy::Secret,
    serde_json::{Value, json},
    tokio::net::{TcpListener, TcpStream},
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            Message,
            client::IntoClientRequest,
            http::HeaderValue,
        },
    },
};

use {
    pincer_agents::{ChatOptions, ChatProvider, ChatResponse, ProviderError, StreamEvent},
    pincer_channels::{
        ChannelBridge, ChannelError, ChannelStatus, IncomingMessage, OutgoingMessage,
    },
    pincer_config::PincerConfig,
    pincer_gateway::{prepare_gateway, serve, state::GatewayState},
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN: &str = "s3cret-token";

async fn start(config: PincerConfig) -> (SocketAddr, Arc<GatewayState>) {
    start_with(config, None).await
}

async fn start_with(
    config: PincerConfig,
    provider: Option<Arc<dyn ChatProvider>>,
) -> (SocketAddr, Arc<GatewayState>) {
    let gateway = prepare_gateway(&config, provider);
    let state = Arc::clone(&gateway.state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, gateway, std::future::pending()));
    (addr, state)
}

fn token_config() -> PincerConfig {
    let mut config = PincerConfig::default();
    config.gateway.auth.token = Some(Secret::new(TOKEN.to_string()));
    config
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

/// Next message of any kind, or None when the socket ends or stays quiet.
async fn next_message(ws: &mut Ws) -> Option<Message> {
    match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
        Ok(Some(Ok(msg))) => Some(msg),
        _ => None,
    }
}

/// Next JSON text frame, skipping control frames.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        match next_message(ws).await.expect("socket ended") {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

/// Read until the close frame and return its code.
async fn close_code(ws: &mut Ws) -> (u16, usize) {
    let mut texts = 0;
    loop {
        match next_message(ws).await.expect("no close frame") {
            Message::Close(Some(frame)) => return (u16::from(frame.code), texts),
            Message::Close(None) => return (0, texts),
            Message::Text(_) => texts += 1,
            _ => {},
        }
    }
}

/// Consume the `connect.challenge` event and the legacy `connected` frame.
async fn skip_greeting(ws: &mut Ws) -> Value {
    let challenge = next_json(ws).await;
    assert_eq!(challenge["type"], "event");
    assert_eq!(challenge["event"], "connect.challenge");
    assert!(challenge["payload"]["nonce"].is_string());
    let connected = next_json(ws).await;
    assert_eq!(connected["type"], "connected");
    connected
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn rpc(ws: &mut Ws, id: &str, method: &str, params: Value) -> Value {
    send(ws, json!({"type": "req", "id": id, "method": method, "params": params})).await;
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == "res" && frame["id"] == id {
            return frame;
        }
    }
}

async fn legacy(ws: &mut Ws, kind: &str, payload: Value) -> Value {
    send(ws, json!({"type": kind, "id": "l1", "timestamp": 0, "payload": payload})).await;
    loop {
        let frame = next_json(ws).await;
        if frame["id"] == "l1" {
            return frame;
        }
    }
}

// ── Admission ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn foreign_origin_closed_without_challenge() {
    let mut config = PincerConfig::default();
    // Exposed bind: loopback peers get no origin bypass.
    config.gateway.bind = "0.0.0.0".into();
    config.gateway.allowed_origins = vec!["https://app.example".into()];
    let (addr, state) = start(config).await;

    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("Origin", HeaderValue::from_static("https://evil.example"));
    let (mut ws, _) = connect_async(req).await.unwrap();

    let (code, texts) = close_code(&mut ws).await;
    assert_eq!(code, 4003);
    assert_eq!(texts, 0, "no challenge may be sent");
    assert_eq!(state.stats.snapshot().rejected_origin, 1);
    let recent = state.audit.get_recent(10);
    assert!(recent.iter().any(|e| e.kind.as_str() == "origin_rejected"));
}

#[tokio::test]
async fn allowlisted_origin_is_accepted() {
    let mut config = PincerConfig::default();
    config.gateway.bind = "0.0.0.0".into();
    config.gateway.allowed_origins = vec!["https://app.example".into()];
    let (addr, _state) = start(config).await;

    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("Origin", HeaderValue::from_static("https://app.example"));
    let (mut ws, _) = connect_async(req).await.unwrap();
    skip_greeting(&mut ws).await;
}

#[tokio::test]
async fn connection_over_per_ip_limit_is_refused() {
    let (addr, state) = start(PincerConfig::default()).await;

    let mut open = Vec::new();
    for _ in 0..20 {
        let mut ws = connect(addr).await;
        skip_greeting(&mut ws).await;
        open.push(ws);
    }

    let mut ws = connect(addr).await;
    let (code, texts) = close_code(&mut ws).await;
    assert_eq!(code, 4029);
    assert_eq!(texts, 0);
    assert_eq!(state.stats.snapshot().rejected_rate, 1);
}

// ── Authentication ───────────────────────────────────────────────────────────

#[tokio::test]
async fn unauthenticated_request_gets_401() {
    let (addr, _state) = start(token_config()).await;
    let mut ws = connect(addr).await;
    let connected = skip_greeting(&mut ws).await;
    assert_eq!(connected["payload"]["authenticated"], false);

    let res = rpc(&mut ws, "1", "sessions.list", json!({})).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], 401);
    assert!(
        res["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Not authenticated")
    );

    let res = legacy(&mut ws, "status", json!({})).await;
    assert_eq!(res["type"], "error");
    assert_eq!(res["payload"]["code"], 401);
}

#[tokio::test]
async fn unauthenticated_legacy_frame_is_refused_before_payload_checks() {
    let (addr, _state) = start(token_config()).await;
    let mut ws = connect(addr).await;
    skip_greeting(&mut ws).await;

    // Malformed payload still answers 401, not invalid-params.
    let res = legacy(&mut ws, "chat", json!({})).await;
    assert_eq!(res["type"], "error");
    assert_eq!(res["payload"]["code"], 401);

    let res = legacy(&mut ws, "session.reset", json!({})).await;
    assert_eq!(res["payload"]["code"], 401);

    // Once authenticated the same frame reports the missing field.
    legacy(&mut ws, "auth", json!({"token": TOKEN})).await;
    let res = legacy(&mut ws, "chat", json!({})).await;
    assert_eq!(res["payload"]["code"], -32602);
}

#[tokio::test]
async fn connect_is_terminal_once_granted() {
    let (addr, state) = start(token_config()).await;
    let mut ws = connect(addr).await;
    skip_greeting(&mut ws).await;

    let bad = json!({"auth": {"token": "wrong"}, "client": {"name": "test", "mode": "cli"}});
    let res = rpc(&mut ws, "1", "connect", bad.clone()).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], 401);

    let good = json!({"auth": {"token": TOKEN}, "client": {"name": "test", "mode": "cli"}});
    let res = rpc(&mut ws, "2", "connect", good).await;
    assert_eq!(res["ok"], true, "{res}");
    let hello = &res["payload"];
    assert_eq!(hello["type"], "hello-ok");
    assert_eq!(hello["protocol"], 3);
    assert!(hello["features"]["methods"]
        .as_array()
        .unwrap()
        .iter()
        .any(|m| m == "chat.send"));
    assert_eq!(hello["policy"]["authMode"], "token");
    assert_eq!(hello["snapshot"]["presence"].as_array().unwrap().len(), 1);

    // A later failed connect does not revoke access.
    let res = rpc(&mut ws, "3", "connect", bad).await;
    assert_eq!(res["ok"], false);
    let res = rpc(&mut ws, "4", "sessions.list", json!({})).await;
    assert_eq!(res["ok"], true);

    let failures = state
        .audit
        .get_recent(50)
        .into_iter()
        .filter(|e| e.kind.as_str() == "auth_failure")
        .count();
    assert_eq!(failures, 2);
}

#[tokio::test]
async fn query_token_pre_authenticates() {
    let (addr, _state) = start(token_config()).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?token={TOKEN}"))
        .await
        .unwrap();
    let connected = skip_greeting(&mut ws).await;
    assert_eq!(connected["payload"]["authenticated"], true);
    let res = rpc(&mut ws, "1", "health", json!({})).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["status"], "ok");
}

#[tokio::test]
async fn legacy_auth_flow() {
    let (addr, _state) = start(token_config()).await;
    let mut ws = connect(addr).await;
    skip_greeting(&mut ws).await;

    let res = legacy(&mut ws, "auth", json!({"token": TOKEN})).await;
    assert_eq!(res["type"], "auth:response");
    assert_eq!(res["payload"]["authenticated"], true);

    let res = legacy(&mut ws, "ping", json!({})).await;
    assert_eq!(res["type"], "ping:response");

    let res = legacy(&mut ws, "nonsense", json!({})).await;
    assert_eq!(res["type"], "error");
    assert_eq!(res["payload"]["code"], -32601);
}

#[tokio::test]
async fn unauthenticated_socket_times_out() {
    let mut config = token_config();
    config.gateway.handshake_timeout_ms = 200;
    let (addr, _state) = start(config).await;
    let mut ws = connect(addr).await;
    let (code, _) = close_code(&mut ws).await;
    assert_eq!(code, 4008);
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn message_rate_limit_keeps_connection_open() {
    let mut config = PincerConfig::default();
    config.gateway.messages_per_minute = 1;
    config.gateway.message_burst = 2;
    let (addr, state) = start(config).await;
    let mut ws = connect(addr).await;
    skip_greeting(&mut ws).await;

    assert_eq!(rpc(&mut ws, "1", "health", json!({})).await["ok"], true);
    assert_eq!(rpc(&mut ws, "2", "health", json!({})).await["ok"], true);

    send(&mut ws, json!({"type": "req", "id": "3", "method": "health"})).await;
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "res");
    assert_eq!(frame["id"], "3");
    assert_eq!(frame["ok"], false);
    assert_eq!(frame["error"]["code"], 429);
    assert!(frame["error"]["retryAfterMs"].as_u64().unwrap() > 0);

    // Legacy frames keep the legacy error shape.
    send(&mut ws, json!({"type": "ping", "id": "l9", "payload": {}})).await;
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["id"], "l9");
    assert_eq!(frame["payload"]["code"], 429);

    assert_eq!(state.client_count().await, 1, "connection stays open");
}

#[tokio::test]
async fn invalid_frames_get_error_frames() {
    let (addr, state) = start(PincerConfig::default()).await;
    let mut ws = connect(addr).await;
    skip_greeting(&mut ws).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["payload"]["code"], -32700);

    send(
        &mut ws,
        json!({"type": "req", "id": "x", "method": "health", "params": {"__proto__": {}}}),
    )
    .await;
    let res = next_json(&mut ws).await;
    assert_eq!(res["type"], "res");
    assert_eq!(res["id"], "x");
    assert_eq!(res["error"]["code"], -32600);

    let res = rpc(&mut ws, "y", "no.such.method", json!({})).await;
    assert_eq!(res["error"]["code"], -32601);

    let rejected = state
        .audit
        .get_recent(50)
        .into_iter()
        .filter(|e| e.kind.as_str() == "input_rejected")
        .count();
    assert_eq!(rejected, 2);
}

#[tokio::test]
async fn handler_failures_are_server_errors() {
    let (addr, _state) = start(PincerConfig::default()).await;
    let mut ws = connect(addr).await;
    skip_greeting(&mut ws).await;

    let res = rpc(&mut ws, "1", "sessions.get", json!({"sessionId": "ghost"})).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], -32000);
    assert!(res["error"]["message"].as_str().unwrap().contains("ghost"));

    let res = rpc(&mut ws, "2", "agents.get", json!({"agentId": "ghost"})).await;
    assert_eq!(res["error"]["code"], -32000);
    assert_eq!(res["error"]["message"], "unknown agent: ghost");

    let res = rpc(&mut ws, "3", "sessions.get", json!({})).await;
    assert_eq!(res["error"]["code"], -32602);
}

// ── Sessions and chat ────────────────────────────────────────────────────────

/// Answers every turn after a fixed delay.
struct SleepyProvider(Duration);

#[async_trait]
impl ChatProvider for SleepyProvider {
    fn name(&self) -> &str {
        "sleepy"
    }

    async fn chat(
        &self,
        _messages: &[Value],
        _options: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        tokio::time::sleep(self.0).await;
        Ok(ChatResponse {
            content: Some("done".into()),
            ..Default::default()
        })
    }

    fn stream(
        &self,
        _messages: Vec<Value>,
        _options: ChatOptions,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        Box::pin(futures::stream::empty())
    }
}

#[tokio::test]
async fn slow_turn_does_not_starve_keepalive() {
    let mut config = PincerConfig::default();
    config.gateway.ping_interval_ms = 100;
    config.gateway.pong_timeout_ms = 300;
    let provider: Arc<dyn ChatProvider> = Arc::new(SleepyProvider(Duration::from_millis(800)));
    let (addr, state) = start_with(config, Some(provider)).await;
    let mut ws = connect(addr).await;
    skip_greeting(&mut ws).await;

    let res = rpc(&mut ws, "1", "chat.send", json!({"content": "first"})).await;
    assert_eq!(res["ok"], true, "{res}");
    let res = rpc(&mut ws, "2", "chat.send", json!({"content": "second"})).await;
    assert_eq!(res["ok"], true, "{res}");

    // Frames queued behind a turn still answer in order.
    let third = json!({"type": "req", "id": "3", "method": "chat.send", "params": {"content": "3rd"}});
    send(&mut ws, third).await;
    send(&mut ws, json!({"type": "req", "id": "4", "method": "health"})).await;
    let mut ids = Vec::new();
    while ids.len() < 2 {
        let frame = next_json(&mut ws).await;
        if frame["type"] == "res" {
            ids.push(frame["id"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(ids, ["3", "4"]);

    assert_eq!(state.stats.snapshot().pong_timeouts, 0);
    assert_eq!(state.client_count().await, 1);
}


#[tokio::test]
async fn reset_command_clears_context() {
    let (addr, _state) = start(PincerConfig::default()).await;
    let mut ws = connect(addr).await;
    skip_greeting(&mut ws).await;

    let res = rpc(&mut ws, "1", "chat.send", json!({"content": "hello there"})).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["queued"], true);
    assert_eq!(res["payload"]["contextLength"], 1);
    let session_id = res["payload"]["sessionId"].as_str().unwrap().to_string();

    let res = rpc(&mut ws, "2", "chat.send", json!({"content": "/reset"})).await;
    let payload = &res["payload"];
    assert_eq!(payload["success"], true);
    assert_eq!(payload["command"], true);
    assert_eq!(payload["action"], "reset");

    let res = rpc(&mut ws, "3", "sessions.get", json!({"sessionId": session_id})).await;
    assert_eq!(res["payload"]["session"]["contextLength"], 0);
    assert_eq!(res["payload"]["context"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn subscribers_receive_chat_events() {
    let (addr, _state) = start(PincerConfig::default()).await;
    let mut watcher = connect(addr).await;
    skip_greeting(&mut watcher).await;
    let res = rpc(&mut watcher, "s", "subscribe", json!({"channels": ["webchat"]})).await;
    assert_eq!(res["payload"]["subscriptions"], json!(["webchat"]));

    let mut sender = connect(addr).await;
    skip_greeting(&mut sender).await;
    rpc(&mut sender, "1", "chat.send", json!({"content": "hi"})).await;

    loop {
        let frame = next_json(&mut watcher).await;
        if frame["type"] == "event" && frame["event"] == "chat" {
            assert_eq!(frame["payload"]["state"], "final");
            assert_eq!(frame["payload"]["channel"], "webchat");
            assert!(frame["seq"].as_u64().unwrap() > 0);
            break;
        }
    }
}

#[tokio::test]
async fn approval_required_tool_is_blocked() {
    let (addr, state) = start(PincerConfig::default()).await;
    let mut ws = connect(addr).await;
    skip_greeting(&mut ws).await;

    let res = rpc(
        &mut ws,
        "1",
        "tools.invoke",
        json!({"name": "exec", "arguments": {"command": "echo nope"}}),
    )
    .await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], 428);
    assert_eq!(state.runtime.stats().tool_blocked, 1);

    let res = rpc(&mut ws, "2", "tools.invoke", json!({"name": "current_time"})).await;
    assert_eq!(res["ok"], true, "{res}");
}

// ── Channels ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingBridge {
    sent: Mutex<Vec<OutgoingMessage>>,
}

#[async_trait]
impl ChannelBridge for RecordingBridge {
    fn id(&self) -> &str {
        "telegram"
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn status(&self) -> ChannelStatus {
        ChannelStatus {
            id: "telegram".into(),
            connected: true,
            details: None,
        }
    }
}

#[tokio::test]
async fn inbound_command_reply_goes_back_through_bridge() {
    let (_addr, state) = start(PincerConfig::default()).await;
    let bridge = Arc::new(RecordingBridge::default());
    state.channels.register(bridge.clone()).await;

    state
        .inbound
        .publish(IncomingMessage::direct("telegram", "42", "u1", "/status"))
        .await
        .unwrap();

    for _ in 0..50 {
        if !bridge.sent.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let sent = bridge.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat_id, "42");
    assert!(sent[0].content.starts_with("Session agent:main:channel:telegram:chat:42"));
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn http_health_and_envelope() {
    let (addr, _state) = start(PincerConfig::default()).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let resp = client
        .get(format!("http://{addr}/api/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["data"].is_array());

    let resp = client
        .delete(format!("http://{addr}/api/sessions/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn http_malformed_input_uses_envelope() {
    let (addr, _state) = start(PincerConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/send"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"].is_string());

    let resp = client
        .post(format!("http://{addr}/api/send"))
        .json(&json!({"channel": "telegram"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .get(format!("http://{addr}/api/audit?limit=lots"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn http_api_requires_bearer_without_loopback_exemption() {
    let mut config = token_config();
    config.api.loopback_exempt = false;
    let (addr, state) = start(config).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{addr}/api/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "unauthorized");

    let resp = client
        .get(format!("http://{addr}/api/status"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["authMode"], "token");

    assert!(
        state
            .audit
            .get_recent(10)
            .iter()
            .any(|e| e.kind.as_str() == "api_auth_failure")
    );
}
