//! The pre-RPC, type-tagged message dialect.
//!
//! Every legacy frame is decoded into a closed [`LegacyRequest`] and handled
//! by one exhaustive match. Responses reuse the request id and carry the type
//! `<type>:response`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use {
    pincer_agents::ChatRequest,
    pincer_protocol::{ErrorShape, LegacyFrame, error_codes},
    pincer_security::AuditEventKind,
};

use crate::{
    broadcast::broadcast_presence,
    chat::{EventSink, run_chat},
    methods::{reset_session, sessions_payload, status_payload},
    state::GatewayState,
};

/// A decoded legacy message.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyRequest {
    Auth {
        token: Option<String>,
        password: Option<String>,
    },
    Ping,
    Subscribe {
        channels: Vec<String>,
    },
    Unsubscribe {
        channels: Vec<String>,
    },
    Chat {
        content: String,
        channel: Option<String>,
        chat_id: Option<String>,
        agent_id: Option<String>,
    },
    Sessions,
    SessionReset {
        session_id: String,
    },
    Status,
    Unknown(String),
}

fn payload_str(payload: &serde_json::Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn payload_list(payload: &serde_json::Value) -> Vec<String> {
    payload
        .get("channels")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl LegacyRequest {
    /// Decode a legacy frame. Missing required payload fields surface as
    /// `Err` with the invalid-params shape.
    pub fn parse(frame: &LegacyFrame) -> Result<Self, ErrorShape> {
        let p = &frame.payload;
        Ok(match frame.r#type.as_str() {
            "auth" => Self::Auth {
                token: payload_str(p, "token"),
                password: payload_str(p, "password"),
            },
            "ping" => Self::Ping,
            "subscribe" => Self::Subscribe {
                channels: payload_list(p),
            },
            "unsubscribe" => Self::Unsubscribe {
                channels: payload_list(p),
            },
            "chat" | "message" => Self::Chat {
                content: payload_str(p, "content")
                    .or_else(|| payload_str(p, "text"))
                    .ok_or_else(|| ErrorShape::invalid_params("missing 'content'"))?,
                channel: payload_str(p, "channel"),
                chat_id: payload_str(p, "chatId"),
                agent_id: payload_str(p, "agentId"),
            },
            "sessions" | "sessions.list" => Self::Sessions,
            "session.reset" => Self::SessionReset {
                session_id: payload_str(p, "sessionId")
                    .ok_or_else(|| ErrorShape::invalid_params("missing 'sessionId'"))?,
            },
            "status" => Self::Status,
            other => Self::Unknown(other.to_string()),
        })
    }

    /// Only `auth` is accepted before authentication. Checked on the raw
    /// type tag so payload errors never leak to an unauthenticated client.
    pub fn allowed_unauthenticated(kind: &str) -> bool {
        kind == "auth"
    }
}

/// Handle one legacy frame and return the frame to send back.
pub async fn handle_legacy(
    state: &Arc<GatewayState>,
    conn_id: &str,
    frame: LegacyFrame,
) -> LegacyFrame {
    let kind = frame.r#type.clone();
    let id = frame.id.clone();

    if !LegacyRequest::allowed_unauthenticated(&kind) && !state.is_authenticated(conn_id).await {
        debug!(conn_id, kind = %kind, "legacy request before auth");
        return LegacyFrame::from_error_shape(id, &ErrorShape::not_authenticated());
    }

    let request = match LegacyRequest::parse(&frame) {
        Ok(r) => r,
        Err(e) => return LegacyFrame::from_error_shape(id, &e),
    };

    debug!(conn_id, kind = %kind, "legacy dispatch");
    match handle_request(state, conn_id, request).await {
        Ok(payload) => LegacyFrame::response(&kind, id, payload),
        Err(e) => LegacyFrame::from_error_shape(id, &e),
    }
}

async fn handle_request(
    state: &Arc<GatewayState>,
    conn_id: &str,
    request: LegacyRequest,
) -> Result<serde_json::Value, ErrorShape> {
    match request {
        LegacyRequest::Auth { token, password } => {
            match state.auth.authorize_connect(token.as_deref(), password.as_deref()) {
                Ok(method) => {
                    state.stats.record_auth(true);
                    state.audit.record(
                        AuditEventKind::AuthSuccess,
                        conn_id,
                        serde_json::json!({ "method": method.as_str(), "dialect": "legacy" }),
                    );
                    if state.mark_authenticated(conn_id, None).await {
                        info!(conn_id, method = method.as_str(), "legacy client authenticated");
                        broadcast_presence(state, conn_id, "joined").await;
                    }
                    Ok(serde_json::json!({ "authenticated": true, "method": method.as_str() }))
                },
                Err(e) => {
                    state.stats.record_auth(false);
                    state.audit.record(
                        AuditEventKind::AuthFailure,
                        conn_id,
                        serde_json::json!({ "reason": e.reason(), "dialect": "legacy" }),
                    );
                    warn!(conn_id, reason = %e.reason(), "legacy auth failed");
                    Err(ErrorShape::new(error_codes::UNAUTHORIZED, e.to_string()))
                },
            }
        },
        LegacyRequest::Ping => Ok(serde_json::json!({ "pong": true })),
        LegacyRequest::Subscribe { channels } => {
            let subs = state.subscribe(conn_id, &channels).await;
            Ok(serde_json::json!({ "subscriptions": subs }))
        },
        LegacyRequest::Unsubscribe { channels } => {
            let subs = state.unsubscribe(conn_id, &channels).await;
            Ok(serde_json::json!({ "subscriptions": subs }))
        },
        LegacyRequest::Chat {
            content,
            channel,
            chat_id,
            agent_id,
        } => {
            let request = ChatRequest {
                agent_id,
                channel: channel.unwrap_or_else(|| "webchat".into()),
                chat_id: chat_id.unwrap_or_else(|| "main".into()),
                peer_id: Some(conn_id.to_string()),
                content,
                stream: false,
                group: false,
                mentioned: true,
            };
            let sink = state
                .clients
                .read()
                .await
                .get(conn_id)
                .map(|c| EventSink {
                    conn_id: conn_id.to_string(),
                    sender: c.sender.clone(),
                });
            let reply = run_chat(state, request, sink).await?;
            Ok(reply.to_json())
        },
        LegacyRequest::Sessions => Ok(sessions_payload(state).await),
        LegacyRequest::SessionReset { session_id } => reset_session(state, &session_id)
            .await
            .map_err(|e| ErrorShape::new(error_codes::NOT_FOUND, e.to_string())),
        LegacyRequest::Status => Ok(status_payload(state).await),
        LegacyRequest::Unknown(kind) => Err(ErrorShape::new(
            error_codes::METHOD_NOT_FOUND,
            format!("unknown message type: {kind}"),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn frame(kind: &str, payload: serde_json::Value) -> LegacyFrame {
        LegacyFrame::new(kind, Some("1".into()), payload)
    }

    #[test]
    fn parses_known_types() {
        let r = LegacyRequest::parse(&frame("auth", serde_json::json!({"token": "t"}))).unwrap();
        assert_eq!(r, LegacyRequest::Auth {
            token: Some("t".into()),
            password: None,
        });
        assert!(LegacyRequest::allowed_unauthenticated("auth"));

        let r = LegacyRequest::parse(&frame(
            "subscribe",
            serde_json::json!({"channels": ["telegram", ""]}),
        ))
        .unwrap();
        assert_eq!(r, LegacyRequest::Subscribe {
            channels: vec!["telegram".into()],
        });
        assert!(!LegacyRequest::allowed_unauthenticated("subscribe"));
        assert!(!LegacyRequest::allowed_unauthenticated("chat"));

        let r = LegacyRequest::parse(&frame("bogus", serde_json::Value::Null)).unwrap();
        assert_eq!(r, LegacyRequest::Unknown("bogus".into()));
    }

    #[test]
    fn chat_requires_content() {
        let err = LegacyRequest::parse(&frame("chat", serde_json::json!({}))).unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
        let r = LegacyRequest::parse(&frame("chat", serde_json::json!({"text": "hi"}))).unwrap();
        assert!(matches!(r, LegacyRequest::Chat { ref content, .. } if content == "hi"));
    }
}
