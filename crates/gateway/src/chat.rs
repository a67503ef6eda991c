use std::sync::Arc;

use {
    tokio::sync::mpsc,
    tracing::{info, warn},
};

use {
    pincer_agents::{
        ChatReply, ChatRequest, RuntimeError,
        runner::{OnEvent, RunnerEvent},
    },
    pincer_channels::{IncomingMessage, OutgoingMessage},
    pincer_protocol::{ErrorShape, EventFrame},
    pincer_security::AuditEventKind,
};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    state::{GatewayState, Outbound},
};

/// Where live run events go while a turn is processed.
pub struct EventSink {
    pub conn_id: String,
    pub sender: mpsc::UnboundedSender<Outbound>,
}

fn runner_payload(run_id: &str, event: &RunnerEvent) -> (&'static str, serde_json::Value) {
    let payload = match event {
        RunnerEvent::Thinking => serde_json::json!({
            "runId": run_id,
            "state": "thinking",
        }),
        RunnerEvent::ThinkingDone => serde_json::json!({
            "runId": run_id,
            "state": "thinking_done",
        }),
        RunnerEvent::ToolCallStart { id, name } => serde_json::json!({
            "runId": run_id,
            "state": "tool_call_start",
            "toolCallId": id,
            "toolName": name,
        }),
        RunnerEvent::ToolCallEnd { id, name, success } => serde_json::json!({
            "runId": run_id,
            "state": "tool_call_end",
            "toolCallId": id,
            "toolName": name,
            "success": success,
        }),
        RunnerEvent::ApprovalRequired { id, name } => {
            return ("tool.approval.required", serde_json::json!({
                "runId": run_id,
                "toolCallId": id,
                "toolName": name,
            }));
        },
        RunnerEvent::TextDelta(text) => serde_json::json!({
            "runId": run_id,
            "state": "delta",
            "text": text,
        }),
        RunnerEvent::Iteration(n) => serde_json::json!({
            "runId": run_id,
            "state": "iteration",
            "iteration": n,
        }),
    };
    ("chat", payload)
}

fn event_callback(state: &Arc<GatewayState>, run_id: &str, sink: Option<EventSink>) -> OnEvent {
    let state = Arc::clone(state);
    let run_id = run_id.to_string();
    Box::new(move |event| {
        if let RunnerEvent::ApprovalRequired { ref name, .. } = event {
            state.audit.record(
                AuditEventKind::ToolApprovalRequired,
                sink.as_ref().map_or("runtime", |s| s.conn_id.as_str()),
                serde_json::json!({ "tool": name, "runId": run_id }),
            );
        }
        let Some(ref sink) = sink else {
            return;
        };
        let (name, payload) = runner_payload(&run_id, &event);
        if let Ok(json) = serde_json::to_string(&EventFrame::new(name, payload, state.next_seq())) {
            let _ = sink.sender.send(Outbound::Text(json));
        }
    })
}

/// Map a runtime failure to the error a client sees. Upstream detail never
/// leaves the process.
pub fn runtime_error_shape(state: &GatewayState, err: &RuntimeError) -> ErrorShape {
    if err.is_upstream() {
        state.stats.record_upstream_error();
        return ErrorShape::internal();
    }
    match err {
        RuntimeError::EmptyMessage => ErrorShape::invalid_params(err.to_string()),
        _ => ErrorShape::server_error(err.to_string()),
    }
}

/// Run one chat turn and fan the result out to subscribers of the channel
/// and the session.
pub async fn run_chat(
    state: &Arc<GatewayState>,
    request: ChatRequest,
    sink: Option<EventSink>,
) -> Result<ChatReply, ErrorShape> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let channel = request.channel.clone();
    let exclude = sink.as_ref().map(|s| s.conn_id.clone());
    let on_event = event_callback(state, &run_id, sink);

    let reply = match state.runtime.handle_message(request, Some(&on_event)).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(run_id, channel = %channel, error = %e, "chat turn failed");
            return Err(runtime_error_shape(state, &e));
        },
    };

    let mut payload = reply.to_json();
    payload["runId"] = serde_json::json!(run_id);
    payload["state"] = serde_json::json!("final");
    payload["channel"] = serde_json::json!(channel);
    let mut opts = BroadcastOpts::topics([channel, reply.session_id().to_string()]);
    opts.exclude = exclude;
    broadcast(state, "chat", payload, opts).await;
    Ok(reply)
}

/// Process a message a bridge published on the inbound bus and deliver the
/// reply through the same bridge.
pub async fn handle_inbound(state: &Arc<GatewayState>, message: IncomingMessage) {
    let mention = state.runtime.default_agent_id().to_string();
    let request = ChatRequest {
        agent_id: None,
        channel: message.channel.clone(),
        chat_id: message.chat_id.clone(),
        peer_id: Some(message.sender_id.clone()),
        content: message.content.clone(),
        stream: false,
        group: message.is_group(),
        mentioned: message.mentions(&mention),
    };
    let reply = match run_chat(state, request, None).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(channel = %message.channel, code = e.code, "inbound message not processed");
            return;
        },
    };
    let Some(text) = reply.reply_text() else {
        return;
    };
    let outgoing = OutgoingMessage::text(message.channel.clone(), message.chat_id.clone(), text);
    match state.channels.send(outgoing).await {
        Ok(()) => info!(channel = %message.channel, chat_id = %message.chat_id, "reply delivered"),
        Err(e) => {
            state.stats.record_delivery_failure(&message.channel);
            warn!(channel = %message.channel, error = %e, "reply delivery failed");
        },
    }
}
