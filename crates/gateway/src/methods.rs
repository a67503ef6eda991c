use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use tracing::{debug, warn};

use {
    pincer_agents::{ChatRequest, ToolError},
    pincer_channels::{ChannelError, OutgoingMessage},
    pincer_protocol::{ErrorShape, PROTOCOL_VERSION, ResponseFrame, error_codes},
    pincer_security::AuditEventKind,
    pincer_sessions::{ActivationMode, SessionError, ThinkingLevel, UsageMode},
};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    chat::{EventSink, run_chat},
    state::GatewayState,
};

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: serde_json::Value,
    pub client_conn_id: String,
    pub state: Arc<GatewayState>,
}

/// The result a method handler produces.
pub type MethodResult = Result<serde_json::Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

/// Handled by the connection engine before the registry is consulted.
pub const CONNECT_METHOD: &str = "connect";

// ── Param helpers ────────────────────────────────────────────────────────────

fn str_param<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn require_str(params: &serde_json::Value, key: &str) -> Result<String, ErrorShape> {
    str_param(params, key)
        .map(str::to_string)
        .ok_or_else(|| ErrorShape::invalid_params(format!("missing '{key}' parameter")))
}

fn topics_param(params: &serde_json::Value) -> Result<Vec<String>, ErrorShape> {
    let list = params
        .get("channels")
        .or_else(|| params.get("topics"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| ErrorShape::invalid_params("missing 'channels' array"))?;
    Ok(list
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn session_error(err: SessionError) -> ErrorShape {
    ErrorShape::server_error(err.to_string())
}

fn parse_setting<T: serde::de::DeserializeOwned>(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<T>, ErrorShape> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|_| ErrorShape::invalid_params(format!("invalid '{key}'"))),
    }
}

// ── Shared operations (RPC, legacy and HTTP) ─────────────────────────────────

pub async fn status_payload(state: &Arc<GatewayState>) -> serde_json::Value {
    let health = state.health_snapshot().await;
    serde_json::json!({
        "version": state.version,
        "hostname": state.hostname,
        "protocol": PROTOCOL_VERSION,
        "uptimeMs": state.uptime_ms(),
        "authMode": state.auth.mode.as_str(),
        "loopbackOnly": state.settings.loopback_only,
        "provider": state.runtime.provider_name(),
        "defaultAgent": state.runtime.default_agent_id(),
        "health": health,
    })
}

pub async fn sessions_payload(state: &Arc<GatewayState>) -> serde_json::Value {
    serde_json::json!(state.runtime.sessions().list().await)
}

pub async fn session_detail(
    state: &Arc<GatewayState>,
    id: &str,
) -> Result<serde_json::Value, SessionError> {
    let handle = state
        .runtime
        .sessions()
        .get(id)
        .await
        .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
    let session = handle.lock().await;
    Ok(serde_json::json!({
        "session": session.summary(),
        "context": session.context,
    }))
}

pub async fn reset_session(
    state: &Arc<GatewayState>,
    id: &str,
) -> Result<serde_json::Value, SessionError> {
    state.runtime.sessions().reset(id).await?;
    Ok(serde_json::json!({ "sessionId": id, "reset": true }))
}

pub async fn delete_session(
    state: &Arc<GatewayState>,
    id: &str,
) -> Result<serde_json::Value, SessionError> {
    state.runtime.sessions().remove(id).await?;
    broadcast(
        state,
        "session.ended",
        serde_json::json!({ "sessionId": id, "reason": "deleted" }),
        BroadcastOpts::topics([id]),
    )
    .await;
    Ok(serde_json::json!({ "sessionId": id, "deleted": true }))
}

pub async fn stats_payload(state: &Arc<GatewayState>) -> serde_json::Value {
    serde_json::json!({
        "gateway": state.stats.snapshot(),
        "runtime": state.runtime.stats(),
        "audit": {
            "recorded": state.audit.total_recorded(),
            "buffered": state.audit.len(),
            "capacity": state.audit.capacity(),
        },
        "connections": state.client_count().await,
        "uptimeMs": state.uptime_ms(),
    })
}

/// Deliver a message through a registered bridge.
pub async fn send_outbound(
    state: &Arc<GatewayState>,
    message: OutgoingMessage,
) -> Result<serde_json::Value, ChannelError> {
    let channel = message.channel.clone();
    let chat_id = message.chat_id.clone();
    if let Err(e) = state.channels.send(message).await {
        if !matches!(e, ChannelError::NotFound(_)) {
            state.stats.record_delivery_failure(&channel);
        }
        return Err(e);
    }
    Ok(serde_json::json!({ "sent": true, "channel": channel, "chatId": chat_id }))
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// RPC methods, populated once at construction.
pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn has(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.client_conn_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return ResponseFrame::err(&request_id, ErrorShape::method_not_found(&method));
        };

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => {
                debug!(method, request_id = %request_id, "method ok");
                ResponseFrame::ok(&request_id, payload)
            },
            Err(err) => {
                warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(&request_id, err)
            },
        }
    }

    /// Registered methods plus `connect`, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.push(CONNECT_METHOD.to_string());
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register_gateway_methods();
        self.register_session_methods();
        self.register_chat_methods();
        self.register_agent_methods();
        self.register_channel_methods();
    }

    // ── Gateway-internal methods ─────────────────────────────────────────

    fn register_gateway_methods(&mut self) {
        self.register(
            "health",
            Box::new(|ctx| {
                Box::pin(async move {
                    let count = ctx.state.client_count().await;
                    Ok(serde_json::json!({
                        "status": "ok",
                        "version": ctx.state.version,
                        "protocol": PROTOCOL_VERSION,
                        "connections": count,
                        "uptimeMs": ctx.state.uptime_ms(),
                    }))
                })
            }),
        );

        self.register(
            "status",
            Box::new(|ctx| Box::pin(async move { Ok(status_payload(&ctx.state).await) })),
        );

        self.register(
            "system-presence",
            Box::new(|ctx| {
                Box::pin(async move {
                    let presence = ctx.state.presence().await;
                    let nodes = ctx.state.nodes.read().await.list();
                    Ok(serde_json::json!({
                        "presence": presence,
                        "nodes": nodes,
                    }))
                })
            }),
        );

        self.register(
            "node.list",
            Box::new(|ctx| {
                Box::pin(async move { Ok(serde_json::json!(ctx.state.nodes.read().await.list())) })
            }),
        );

        self.register(
            "subscribe",
            Box::new(|ctx| {
                Box::pin(async move {
                    let topics = topics_param(&ctx.params)?;
                    let subs = ctx.state.subscribe(&ctx.client_conn_id, &topics).await;
                    Ok(serde_json::json!({ "subscriptions": subs }))
                })
            }),
        );

        self.register(
            "unsubscribe",
            Box::new(|ctx| {
                Box::pin(async move {
                    let topics = topics_param(&ctx.params)?;
                    let subs = ctx.state.unsubscribe(&ctx.client_conn_id, &topics).await;
                    Ok(serde_json::json!({ "subscriptions": subs }))
                })
            }),
        );

        self.register(
            "audit.recent",
            Box::new(|ctx| {
                Box::pin(async move {
                    let limit = ctx
                        .params
                        .get("limit")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(50) as usize;
                    Ok(serde_json::json!(ctx.state.audit.get_recent(limit)))
                })
            }),
        );

        self.register(
            "stats",
            Box::new(|ctx| Box::pin(async move { Ok(stats_payload(&ctx.state).await) })),
        );
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    fn register_session_methods(&mut self) {
        self.register(
            "sessions.list",
            Box::new(|ctx| Box::pin(async move { Ok(sessions_payload(&ctx.state).await) })),
        );

        self.register(
            "sessions.get",
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = require_str(&ctx.params, "sessionId")?;
                    session_detail(&ctx.state, &id).await.map_err(session_error)
                })
            }),
        );

        self.register(
            "sessions.reset",
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = require_str(&ctx.params, "sessionId")?;
                    reset_session(&ctx.state, &id).await.map_err(session_error)
                })
            }),
        );

        self.register(
            "sessions.delete",
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = require_str(&ctx.params, "sessionId")?;
                    delete_session(&ctx.state, &id).await.map_err(session_error)
                })
            }),
        );

        self.register(
            "sessions.patch",
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = require_str(&ctx.params, "sessionId")?;
                    let thinking: Option<ThinkingLevel> = parse_setting(&ctx.params, "thinking")?;
                    let verbose: Option<bool> = parse_setting(&ctx.params, "verbose")?;
                    let usage: Option<UsageMode> = parse_setting(&ctx.params, "usage")?;
                    let activation: Option<ActivationMode> =
                        parse_setting(&ctx.params, "activation")?;
                    let max_context: Option<usize> =
                        parse_setting(&ctx.params, "maxContextMessages")?;
                    if max_context == Some(0) {
                        return Err(ErrorShape::invalid_params("maxContextMessages must be positive"));
                    }

                    let handle = ctx
                        .state
                        .runtime
                        .sessions()
                        .get(&id)
                        .await
                        .ok_or_else(|| session_error(SessionError::NotFound(id.clone())))?;
                    let mut session = handle.lock().await;
                    if let Some(v) = thinking {
                        session.settings.thinking = v;
                    }
                    if let Some(v) = verbose {
                        session.settings.verbose = v;
                    }
                    if let Some(v) = usage {
                        session.settings.usage = v;
                    }
                    if let Some(v) = activation {
                        session.settings.activation = v;
                    }
                    if let Some(v) = max_context {
                        session.settings.max_context_messages = v;
                        session.trim_context();
                    }
                    session.touch();
                    Ok(serde_json::json!(session.summary()))
                })
            }),
        );
    }

    // ── Chat ─────────────────────────────────────────────────────────────

    fn register_chat_methods(&mut self) {
        self.register(
            "chat.send",
            Box::new(|ctx| {
                Box::pin(async move {
                    let content = str_param(&ctx.params, "content")
                        .or_else(|| str_param(&ctx.params, "text"))
                        .ok_or_else(|| ErrorShape::invalid_params("missing 'content' parameter"))?
                        .to_string();
                    let stream = ctx
                        .params
                        .get("stream")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let request = ChatRequest {
                        agent_id: str_param(&ctx.params, "agentId").map(str::to_string),
                        channel: str_param(&ctx.params, "channel")
                            .unwrap_or("webchat")
                            .to_string(),
                        chat_id: str_param(&ctx.params, "chatId").unwrap_or("main").to_string(),
                        peer_id: Some(ctx.client_conn_id.clone()),
                        content,
                        stream,
                        group: false,
                        mentioned: true,
                    };
                    let sender = ctx
                        .state
                        .clients
                        .read()
                        .await
                        .get(&ctx.client_conn_id)
                        .map(|c| c.sender.clone());
                    let sink = sender.map(|sender| EventSink {
                        conn_id: ctx.client_conn_id.clone(),
                        sender,
                    });
                    let reply = run_chat(&ctx.state, request, sink).await?;
                    Ok(reply.to_json())
                })
            }),
        );

        self.register(
            "chat.history",
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = require_str(&ctx.params, "sessionId")?;
                    let limit = ctx.params.get("limit").and_then(|v| v.as_u64());
                    let handle = ctx
                        .state
                        .runtime
                        .sessions()
                        .get(&id)
                        .await
                        .ok_or_else(|| session_error(SessionError::NotFound(id.clone())))?;
                    let session = handle.lock().await;
                    let skip = limit
                        .map(|n| session.context.len().saturating_sub(n as usize))
                        .unwrap_or(0);
                    Ok(serde_json::json!(&session.context[skip..]))
                })
            }),
        );
    }

    // ── Agents and tools ─────────────────────────────────────────────────

    fn register_agent_methods(&mut self) {
        self.register(
            "agents.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    Ok(serde_json::json!({
                        "default": ctx.state.runtime.default_agent_id(),
                        "agents": ctx.state.runtime.list_agents().await,
                    }))
                })
            }),
        );

        self.register(
            "agents.get",
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = require_str(&ctx.params, "agentId")?;
                    let agent = ctx.state.runtime.agent(&id).await.ok_or_else(|| {
                        ErrorShape::server_error(format!("unknown agent: {id}"))
                    })?;
                    Ok(serde_json::json!(agent.info()))
                })
            }),
        );

        self.register(
            "tools.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = str_param(&ctx.params, "agentId")
                        .unwrap_or(ctx.state.runtime.default_agent_id())
                        .to_string();
                    let agent = ctx.state.runtime.agent(&id).await.ok_or_else(|| {
                        ErrorShape::server_error(format!("unknown agent: {id}"))
                    })?;
                    Ok(serde_json::json!(ctx.state.runtime.tools().describe(agent.policy())))
                })
            }),
        );

        self.register(
            "tools.invoke",
            Box::new(|ctx| {
                Box::pin(async move {
                    let name = require_str(&ctx.params, "name")?;
                    let arguments = ctx
                        .params
                        .get("arguments")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({}));
                    let agent_id = str_param(&ctx.params, "agentId");
                    let session_id = str_param(&ctx.params, "sessionId").map(str::to_string);
                    let result = ctx
                        .state
                        .runtime
                        .execute_tool(agent_id, &name, arguments, session_id)
                        .await
                        .map_err(|e| ErrorShape::server_error(e.to_string()))?;

                    if result.requires_approval {
                        ctx.state.audit.record(
                            AuditEventKind::ToolApprovalRequired,
                            ctx.client_conn_id.as_str(),
                            serde_json::json!({ "tool": name }),
                        );
                        broadcast(
                            &ctx.state,
                            "tool.approval.required",
                            serde_json::json!({ "toolName": name, "connId": ctx.client_conn_id }),
                            BroadcastOpts::default(),
                        )
                        .await;
                        return Err(ErrorShape::new(
                            error_codes::APPROVAL_REQUIRED,
                            ToolError::ApprovalRequired(name.clone()).to_string(),
                        )
                        .with_details(serde_json::json!({ "tool": name, "requiresApproval": true })));
                    }
                    if result.success {
                        ctx.state.audit.record(
                            AuditEventKind::ToolExecuted,
                            ctx.client_conn_id.as_str(),
                            serde_json::json!({ "tool": name }),
                        );
                        return Ok(serde_json::json!(result));
                    }
                    Err(ErrorShape::server_error(
                        result.error.unwrap_or_else(|| format!("tool '{name}' failed")),
                    ))
                })
            }),
        );
    }

    // ── Channels ─────────────────────────────────────────────────────────

    fn register_channel_methods(&mut self) {
        self.register(
            "channels.list",
            Box::new(|ctx| {
                Box::pin(async move { Ok(serde_json::json!(ctx.state.channels.statuses().await)) })
            }),
        );

        self.register(
            "send",
            Box::new(|ctx| {
                Box::pin(async move {
                    let message = OutgoingMessage {
                        reply_to: str_param(&ctx.params, "replyTo").map(str::to_string),
                        ..OutgoingMessage::text(
                            require_str(&ctx.params, "channel")?,
                            require_str(&ctx.params, "chatId")?,
                            require_str(&ctx.params, "content")?,
                        )
                    };
                    send_outbound(&ctx.state, message)
                        .await
                        .map_err(|e| match e {
                            ChannelError::NotFound(_) => ErrorShape::server_error(e.to_string()),
                            _ => ErrorShape::internal(),
                        })
                })
            }),
        );
    }
}
