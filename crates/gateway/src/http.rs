//! HTTP admin API under `/api`, with the `{success, data}` envelope.

use std::net::SocketAddr;

use {
    axum::{
        Json, Router,
        extract::{
            ConnectInfo, Path, Query, Request, State,
            rejection::{JsonRejection, QueryRejection},
        },
        http::{StatusCode, header},
        middleware::{self, Next},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    serde::{Deserialize, Serialize},
    thiserror::Error,
    tracing::warn,
};

use {
    pincer_channels::{ChannelError, OutgoingMessage},
    pincer_security::AuditEventKind,
    pincer_sessions::SessionError,
};

use crate::{
    auth::is_loopback,
    methods::{
        delete_session, reset_session, send_outbound, session_detail, sessions_payload,
        stats_payload, status_payload,
    },
    server::AppState,
};

const DEFAULT_AUDIT_LIMIT: usize = 100;

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    /// Channel or provider failure. Detail stays in the logs.
    #[error("upstream failure")]
    Upstream,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Upstream => "upstream_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => Self::NotFound(err.to_string()),
        }
    }
}

impl From<ChannelError> for ApiError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotFound(_) => Self::NotFound(err.to_string()),
            _ => Self::Upstream,
        }
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok(data: serde_json::Value) -> ApiResult {
    Ok(Json(serde_json::json!({ "success": true, "data": data })))
}

// ── Router ───────────────────────────────────────────────────────────────────

/// `/api/*` routes behind bearer auth.
pub fn api_router(app_state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/sessions", get(api_sessions))
        .route(
            "/api/sessions/{id}",
            get(api_session_get).delete(api_session_delete),
        )
        .route("/api/sessions/{id}/reset", post(api_session_reset))
        .route("/api/channels", get(api_channels))
        .route("/api/agents", get(api_agents))
        .route("/api/stats", get(api_stats))
        .route("/api/metrics", get(api_metrics))
        .route("/api/audit", get(api_audit))
        .route("/api/send", post(api_send))
        .layer(middleware::from_fn_with_state(app_state, require_api_auth))
}

fn bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

async fn require_api_auth(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let gw = &state.gateway;
    if gw.settings.api_loopback_exempt && is_loopback(addr.ip()) {
        return next.run(req).await;
    }
    match gw.auth.authorize_bearer(bearer(&req)) {
        Ok(_) => next.run(req).await,
        Err(e) => {
            gw.audit.record(
                AuditEventKind::ApiAuthFailure,
                addr.ip().to_string(),
                serde_json::json!({ "path": req.uri().path(), "reason": e.reason() }),
            );
            warn!(remote = %addr, path = %req.uri().path(), "api: unauthorized");
            ApiError::Unauthorized(e.to_string()).into_response()
        },
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn api_status(State(state): State<AppState>) -> ApiResult {
    ok(status_payload(&state.gateway).await)
}

async fn api_sessions(State(state): State<AppState>) -> ApiResult {
    ok(sessions_payload(&state.gateway).await)
}

async fn api_session_get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(session_detail(&state.gateway, &id).await?)
}

async fn api_session_delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(delete_session(&state.gateway, &id).await?)
}

async fn api_session_reset(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(reset_session(&state.gateway, &id).await?)
}

async fn api_channels(State(state): State<AppState>) -> ApiResult {
    ok(serde_json::json!(state.gateway.channels.statuses().await))
}

async fn api_agents(State(state): State<AppState>) -> ApiResult {
    let runtime = &state.gateway.runtime;
    ok(serde_json::json!({
        "default": runtime.default_agent_id(),
        "agents": runtime.list_agents().await,
    }))
}

async fn api_stats(State(state): State<AppState>) -> ApiResult {
    ok(stats_payload(&state.gateway).await)
}

/// Flat metric name to value map.
async fn api_metrics(State(state): State<AppState>) -> ApiResult {
    let gw = &state.gateway;
    let s = gw.stats.snapshot();
    let r = gw.runtime.stats();
    ok(serde_json::json!({
        "pincer_ws_connections_total": s.connections_total,
        "pincer_ws_connections_active": gw.client_count().await,
        "pincer_ws_rejected_origin_total": s.rejected_origin,
        "pincer_ws_rejected_rate_limit_total": s.rejected_rate,
        "pincer_ws_handshake_timeouts_total": s.handshake_timeouts,
        "pincer_ws_pong_timeouts_total": s.pong_timeouts,
        "pincer_auth_failures_total": s.auth_failures,
        "pincer_messages_total": s.messages_total,
        "pincer_messages_rejected_total": s.messages_rejected,
        "pincer_messages_rate_limited_total": s.messages_rate_limited,
        "pincer_upstream_errors_total": s.upstream_errors,
        "pincer_tool_calls_total": r.tool_calls,
        "pincer_tool_blocked_total": r.tool_blocked,
        "pincer_sessions_active": gw.runtime.sessions().len().await,
        "pincer_sessions_evicted_total": r.sessions_evicted,
        "pincer_audit_events_total": gw.audit.total_recorded(),
    }))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

async fn api_audit(
    State(state): State<AppState>,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> ApiResult {
    let Query(q) = query?;
    let limit = q.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
    ok(serde_json::json!(state.gateway.audit.get_recent(limit)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBody {
    channel: String,
    chat_id: String,
    content: String,
    #[serde(default)]
    reply_to: Option<String>,
}

async fn api_send(
    State(state): State<AppState>,
    body: Result<Json<SendBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    if body.content.is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }
    let message = OutgoingMessage {
        reply_to: body.reply_to,
        ..OutgoingMessage::text(body.channel, body.chat_id, body.content)
    };
    ok(send_outbound(&state.gateway, message).await?)
}
