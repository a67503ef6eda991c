use std::time::Duration;

use {
    pincer_sessions::ChatMessage,
    tokio_stream::StreamExt,
    tracing::{debug, info, warn},
};

use crate::{
    agent::Agent,
    model::{ChatProvider, ChatResponse, ProviderError, StreamEvent, Usage},
    runtime::RuntimeError,
    tool_registry::{ToolContext, ToolError, ToolRegistry},
};

/// Maximum number of tool-call loop iterations before giving up.
pub const MAX_ITERATIONS: usize = 25;

/// Result of running the agent loop.
#[derive(Debug, Default)]
pub struct AgentRunResult {
    pub text: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    pub usage: Usage,
    /// Messages produced by the run, to be appended to the session in order.
    pub new_messages: Vec<ChatMessage>,
}

/// Callback for streaming events out of the runner.
pub type OnEvent = Box<dyn Fn(RunnerEvent) + Send + Sync>;

/// Events emitted during the agent run.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Thinking,
    ThinkingDone,
    ToolCallStart { id: String, name: String },
    ToolCallEnd { id: String, name: String, success: bool },
    ApprovalRequired { id: String, name: String },
    TextDelta(String),
    Iteration(usize),
}

/// Everything one run needs besides the conversation.
pub struct RunParams<'a> {
    pub provider: &'a dyn ChatProvider,
    pub agent: &'a Agent,
    pub tools: &'a ToolRegistry,
    pub tool_ctx: ToolContext,
    pub timeout: Duration,
}

fn emit(on_event: Option<&OnEvent>, event: RunnerEvent) {
    if let Some(cb) = on_event {
        cb(event);
    }
}

fn provider_messages(agent: &Agent, history: &[ChatMessage]) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(ref prompt) = agent.config.system_prompt {
        messages.push(serde_json::json!({"role": "system", "content": prompt}));
    }
    messages.extend(history.iter().map(ChatMessage::to_provider_json));
    messages
}

async fn call_provider(
    params: &RunParams<'_>,
    messages: &[serde_json::Value],
    tools: &[serde_json::Value],
) -> Result<ChatResponse, ProviderError> {
    let options = params.agent.chat_options(tools.to_vec());
    match tokio::time::timeout(params.timeout, params.provider.chat(messages, &options)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::timeout(params.timeout)),
    }
}

/// Run the agent loop: send the conversation to the provider, execute tool
/// calls through the gate, repeat until the model answers with text.
pub async fn run_agent_loop(
    params: &RunParams<'_>,
    history: &[ChatMessage],
    on_event: Option<&OnEvent>,
) -> Result<AgentRunResult, RuntimeError> {
    let tool_schemas = params.tools.list_schemas(params.agent.policy());
    let mut messages = provider_messages(params.agent, history);
    let mut result = AgentRunResult::default();

    loop {
        result.iterations += 1;
        if result.iterations > MAX_ITERATIONS {
            warn!("agent loop exceeded max iterations ({})", MAX_ITERATIONS);
            return Err(RuntimeError::IterationLimit(MAX_ITERATIONS));
        }
        emit(on_event, RunnerEvent::Iteration(result.iterations));
        debug!(iteration = result.iterations, agent_id = %params.agent.id(), "calling provider");

        emit(on_event, RunnerEvent::Thinking);
        let response = call_provider(params, &messages, &tool_schemas).await?;
        emit(on_event, RunnerEvent::ThinkingDone);

        if let Some(ref usage) = response.usage {
            result.usage.add(usage);
        }

        if response.tool_calls.is_empty() {
            result.text = response.content.unwrap_or_default();
            result
                .new_messages
                .push(ChatMessage::assistant(result.text.clone()));
            info!(
                iterations = result.iterations,
                tool_calls = result.tool_calls_made,
                "agent loop complete"
            );
            return Ok(result);
        }

        let tool_calls_json: Vec<serde_json::Value> = response
            .tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();
        let mut assistant = ChatMessage::assistant(response.content.clone().unwrap_or_default());
        assistant.tool_calls = Some(serde_json::Value::Array(tool_calls_json));
        messages.push(assistant.to_provider_json());
        result.new_messages.push(assistant);

        for tc in &response.tool_calls {
            result.tool_calls_made += 1;
            emit(on_event, RunnerEvent::ToolCallStart {
                id: tc.id.clone(),
                name: tc.name.clone(),
            });

            let outcome = params
                .tools
                .execute(&tc.name, tc.arguments.clone(), &params.tool_ctx, params.agent.policy())
                .await;
            if let Err(ToolError::ApprovalRequired(ref name)) = outcome {
                emit(on_event, RunnerEvent::ApprovalRequired {
                    id: tc.id.clone(),
                    name: name.clone(),
                });
            }
            let success = outcome.is_ok();
            let content = match outcome {
                Ok(val) => serde_json::json!({ "result": val }),
                Err(e) => {
                    warn!(tool = %tc.name, error = %e, "tool call failed");
                    serde_json::json!({ "error": e.to_string() })
                },
            };
            emit(on_event, RunnerEvent::ToolCallEnd {
                id: tc.id.clone(),
                name: tc.name.clone(),
                success,
            });

            let tool_msg = ChatMessage::tool_result(tc.id.clone(), content.to_string());
            messages.push(tool_msg.to_provider_json());
            result.new_messages.push(tool_msg);
        }
    }
}

/// Stream a single completion without tools, relaying deltas.
pub async fn run_streaming(
    params: &RunParams<'_>,
    history: &[ChatMessage],
    on_event: Option<&OnEvent>,
) -> Result<AgentRunResult, RuntimeError> {
    let messages = provider_messages(params.agent, history);
    let options = params.agent.chat_options(Vec::new());

    let consume = async {
        let mut stream = params.provider.stream(messages, options);
        let mut text = String::new();
        let mut usage = Usage::default();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Delta(delta) => {
                    text.push_str(&delta);
                    emit(on_event, RunnerEvent::TextDelta(delta));
                },
                StreamEvent::Done(u) => {
                    usage = u;
                    break;
                },
                StreamEvent::Error(msg) => return Err(ProviderError::Upstream(msg)),
            }
        }
        Ok((text, usage))
    };

    let (text, usage) = match tokio::time::timeout(params.timeout, consume).await {
        Ok(res) => res?,
        Err(_) => return Err(ProviderError::timeout(params.timeout).into()),
    };
    Ok(AgentRunResult {
        new_messages: vec![ChatMessage::assistant(text.clone())],
        text,
        iterations: 1,
        tool_calls_made: 0,
        usage,
    })
}
