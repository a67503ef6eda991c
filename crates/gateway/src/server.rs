use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use {
    axum::{
        Router,
        extract::{ConnectInfo, Query, State, WebSocketUpgrade},
        http::{HeaderMap, header},
        response::{IntoResponse, Json},
        routing::get,
    },
    tokio::{net::TcpListener, task::JoinHandle},
    tower_http::cors::{Any, CorsLayer},
    tracing::{info, warn},
};

use {
    pincer_agents::{
        AgentRuntime, ChatProvider, ToolPolicy, ToolRegistry,
        builtin_tools::{CurrentTimeTool, ExecTool},
    },
    pincer_channels::{ChannelRegistry, InboundBus, InboundReceiver, bus::DEFAULT_BUS_CAPACITY},
    pincer_config::PincerConfig,
    pincer_protocol::PROTOCOL_VERSION,
    pincer_security::AuditEventKind,
    pincer_sessions::{SessionSettings, SessionStore},
};

use crate::{
    auth::ResolvedAuth,
    broadcast::{BroadcastOpts, broadcast, broadcast_tick},
    chat::handle_inbound,
    http::api_router,
    methods::MethodRegistry,
    state::{GatewaySettings, GatewayState},
    ws::handle_connection,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub methods: Arc<MethodRegistry>,
}

// ── Assembly ─────────────────────────────────────────────────────────────────

/// Everything `serve` needs, built from config.
pub struct Gateway {
    pub state: Arc<GatewayState>,
    pub methods: Arc<MethodRegistry>,
    inbound: InboundReceiver,
}

/// Build the runtime and gateway state from config. `provider` is the
/// upstream model backend; without one, chat messages are only recorded.
pub fn prepare_gateway(config: &PincerConfig, provider: Option<Arc<dyn ChatProvider>>) -> Gateway {
    let sessions = Arc::new(SessionStore::new(
        Duration::from_secs(config.sessions.ttl_secs),
        SessionSettings {
            max_context_messages: config.sessions.max_context_messages,
            ..SessionSettings::default()
        },
    ));

    let mut tools = ToolRegistry::new().with_global_policy(ToolPolicy {
        require_approval: config.tools.require_approval.clone(),
        ..ToolPolicy::default()
    });
    tools.register(Arc::new(CurrentTimeTool));
    let exec = &config.tools.exec;
    if exec.enabled {
        tools.register(Arc::new(ExecTool {
            default_timeout: Duration::from_secs(exec.timeout_secs),
            max_output_bytes: exec.max_output_bytes,
            working_dir: None,
            require_approval: exec.require_approval,
        }));
    }

    let mut runtime = AgentRuntime::new(sessions, Arc::new(tools))
        .with_agents(config.agents.list.clone(), config.agents.default.clone())
        .with_provider_timeout(Duration::from_millis(config.provider.timeout_ms));
    if let Some(provider) = provider {
        runtime = runtime.with_provider(provider);
    }

    let (bus, inbound) = InboundBus::new(DEFAULT_BUS_CAPACITY);
    let state = GatewayState::new(
        GatewaySettings::from_config(config),
        ResolvedAuth::from_config(&config.gateway.auth),
        Arc::new(runtime),
        ChannelRegistry::new(),
        bus,
    );

    Gateway {
        state,
        methods: Arc::new(MethodRegistry::new()),
        inbound,
    }
}

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let app_state = AppState {
        gateway: state,
        methods,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .merge(api_router(app_state.clone()))
        .layer(cors)
        .with_state(app_state)
}

// ── Background tasks ─────────────────────────────────────────────────────────

fn spawn_tick(state: Arc<GatewayState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.settings.tick_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            broadcast_tick(&state).await;
        }
    })
}

/// TTL eviction of idle sessions plus limiter housekeeping.
fn spawn_sweeper(state: Arc<GatewayState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.settings.session_sweep_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            for id in state.runtime.sweep_sessions().await {
                state.audit.record(
                    AuditEventKind::SessionEvicted,
                    id.as_str(),
                    serde_json::json!({ "reason": "ttl" }),
                );
                broadcast(
                    &state,
                    "session.ended",
                    serde_json::json!({ "sessionId": id, "reason": "expired" }),
                    BroadcastOpts::topics([id.as_str()]),
                )
                .await;
            }
            state.connection_limiter.sweep();
            state.message_limiter.sweep();
        }
    })
}

fn spawn_inbound(state: Arc<GatewayState>, mut inbound: InboundReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let state = Arc::clone(&state);
            tokio::spawn(async move { handle_inbound(&state, message).await });
        }
    })
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    gateway: Gateway,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let Gateway {
        state,
        methods,
        inbound,
    } = gateway;

    let tasks = [
        spawn_tick(Arc::clone(&state)),
        spawn_sweeper(Arc::clone(&state)),
        spawn_inbound(Arc::clone(&state), inbound),
    ];

    let app = build_gateway_app(Arc::clone(&state), methods);
    // Run the server with ConnectInfo for remote IP extraction.
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    for task in tasks {
        task.abort();
    }
    result?;
    Ok(())
}

/// Start the gateway HTTP + WebSocket server.
pub async fn start_gateway(
    config: PincerConfig,
    provider: Option<Arc<dyn ChatProvider>>,
) -> anyhow::Result<()> {
    let gateway = prepare_gateway(&config, provider);
    let state = Arc::clone(&gateway.state);

    let listener = TcpListener::bind((config.gateway.bind.as_str(), config.gateway.port)).await?;
    let addr = listener.local_addr()?;

    // Startup banner.
    let lines = [
        format!("pincer gateway v{}", state.version),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!("{} methods registered", gateway.methods.method_names().len()),
        format!(
            "auth: {}, agents: {}, provider: {}",
            state.auth.mode.as_str(),
            state.runtime.agent_count().await,
            state.runtime.provider_name().unwrap_or("none"),
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let shutdown_state = Arc::clone(&state);
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutting down");
        broadcast(
            &shutdown_state,
            "shutdown",
            serde_json::json!({ "reason": "signal" }),
            BroadcastOpts::default(),
        )
        .await;
    };

    serve(listener, gateway, shutdown).await
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.gateway.client_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
        "protocol": PROTOCOL_VERSION,
        "connections": count,
        "uptimeMs": state.gateway.uptime_ms(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let token = query.get("token").cloned();
    ws.on_upgrade(move |socket| {
        handle_connection(socket, state.gateway, state.methods, addr, origin, token)
    })
}
