use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    serde::Serialize,
    thiserror::Error,
    tokio::sync::RwLock,
    tracing::{debug, error, info, warn},
};

use pincer_sessions::{
    ActivationMode, ChatCommand, ChatMessage, CommandOutcome, SessionError, SessionOrigin,
    SessionStore,
};

use crate::{
    agent::{Agent, AgentConfig, AgentInfo, DEFAULT_AGENT_ID},
    model::{ChatProvider, ProviderError, Usage},
    runner::{OnEvent, RunParams, run_agent_loop, run_streaming},
    tool_registry::{ToolContext, ToolError, ToolRegistry, ToolResult},
};

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("message content is empty")]
    EmptyMessage,
    #[error(transparent)]
    Upstream(#[from] ProviderError),
    #[error("agent loop exceeded {0} iterations")]
    IterationLimit(usize),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl RuntimeError {
    /// Failures caused by the model backend rather than the caller.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::IterationLimit(_))
    }
}

/// One inbound chat turn.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub agent_id: Option<String>,
    pub channel: String,
    pub chat_id: String,
    pub peer_id: Option<String>,
    pub content: String,
    pub stream: bool,
    pub group: bool,
    pub mentioned: bool,
}

#[derive(Debug, Clone)]
pub enum ChatReply {
    /// A slash command was applied; nothing reached the model.
    Command {
        session_id: String,
        outcome: CommandOutcome,
    },
    CommandRejected {
        session_id: String,
        error: String,
    },
    Message {
        session_id: String,
        content: String,
        usage: Usage,
        tool_calls: usize,
    },
    /// Appended to the context but no provider is configured.
    Recorded {
        session_id: String,
        context_length: usize,
    },
    /// Group message without a mention while activation is `mention`.
    Ignored { session_id: String },
}

impl ChatReply {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Command { session_id, .. }
            | Self::CommandRejected { session_id, .. }
            | Self::Message { session_id, .. }
            | Self::Recorded { session_id, .. }
            | Self::Ignored { session_id } => session_id,
        }
    }

    /// Text to deliver back to the originating chat, if any.
    pub fn reply_text(&self) -> Option<&str> {
        match self {
            Self::Command { outcome, .. } => Some(&outcome.message),
            Self::CommandRejected { error, .. } => Some(error),
            Self::Message { content, .. } => Some(content),
            Self::Recorded { .. } | Self::Ignored { .. } => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Command {
                session_id,
                outcome,
            } => {
                let mut v = serde_json::json!({
                    "success": true,
                    "command": true,
                    "action": outcome.action,
                    "message": outcome.message,
                    "sessionId": session_id,
                });
                if let Some(ref data) = outcome.data {
                    v["data"] = data.clone();
                }
                v
            },
            Self::CommandRejected { session_id, error } => serde_json::json!({
                "success": false,
                "command": true,
                "error": error,
                "sessionId": session_id,
            }),
            Self::Message {
                session_id,
                content,
                usage,
                tool_calls,
            } => serde_json::json!({
                "success": true,
                "sessionId": session_id,
                "content": content,
                "usage": usage,
                "toolCalls": tool_calls,
            }),
            Self::Recorded {
                session_id,
                context_length,
            } => serde_json::json!({
                "success": true,
                "sessionId": session_id,
                "queued": true,
                "contextLength": context_length,
            }),
            Self::Ignored { session_id } => serde_json::json!({
                "success": true,
                "sessionId": session_id,
                "ignored": true,
            }),
        }
    }
}

#[derive(Default)]
struct Counters {
    messages: AtomicU64,
    commands: AtomicU64,
    provider_calls: AtomicU64,
    upstream_errors: AtomicU64,
    tool_calls: AtomicU64,
    tool_blocked: AtomicU64,
    sessions_evicted: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub messages: u64,
    pub commands: u64,
    pub provider_calls: u64,
    pub upstream_errors: u64,
    pub tool_calls: u64,
    pub tool_blocked: u64,
    pub sessions_evicted: u64,
}

/// Routes chat turns to agents and keeps session state consistent.
pub struct AgentRuntime {
    agents: RwLock<HashMap<String, Arc<Agent>>>,
    default_agent: String,
    sessions: Arc<SessionStore>,
    tools: Arc<ToolRegistry>,
    provider: Option<Arc<dyn ChatProvider>>,
    provider_timeout: Duration,
    counters: Counters,
}

impl AgentRuntime {
    pub fn new(sessions: Arc<SessionStore>, tools: Arc<ToolRegistry>) -> Self {
        let mut agents = HashMap::new();
        agents.insert(
            DEFAULT_AGENT_ID.to_string(),
            Arc::new(Agent::new(AgentConfig::default())),
        );
        Self {
            agents: RwLock::new(agents),
            default_agent: DEFAULT_AGENT_ID.into(),
            sessions,
            tools,
            provider: None,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            counters: Counters::default(),
        }
    }

    /// Replace the agent set. `default_agent` falls back to the first
    /// definition when it names none of them.
    pub fn with_agents(mut self, configs: Vec<AgentConfig>, default_agent: Option<String>) -> Self {
        if configs.is_empty() {
            return self;
        }
        let first = configs[0].id.clone();
        let agents: HashMap<_, _> = configs
            .into_iter()
            .map(|c| (c.id.clone(), Arc::new(Agent::new(c))))
            .collect();
        self.default_agent = default_agent
            .filter(|id| agents.contains_key(id))
            .unwrap_or(first);
        *self.agents.get_mut() = agents;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn default_agent_id(&self) -> &str {
        &self.default_agent
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_deref().map(|p| p.name())
    }

    pub async fn agent(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let mut list: Vec<_> = self.agents.read().await.values().map(|a| a.info()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Register an agent at runtime; replaces any agent with the same id.
    pub async fn register_agent(&self, config: AgentConfig) -> Arc<Agent> {
        let agent = Arc::new(Agent::new(config));
        info!(agent_id = %agent.id(), "agent registered");
        self.agents
            .write()
            .await
            .insert(agent.id().to_string(), Arc::clone(&agent));
        agent
    }

    async fn resolve_agent(&self, id: Option<&str>) -> Result<Arc<Agent>, RuntimeError> {
        let id = id.unwrap_or(&self.default_agent);
        self.agent(id)
            .await
            .ok_or_else(|| RuntimeError::UnknownAgent(id.to_string()))
    }

    /// Process one chat turn.
    ///
    /// The session mutex is held for the whole turn, so turns on one session
    /// are serialized and the TTL sweep never evicts a session mid-turn.
    pub async fn handle_message(
        &self,
        request: ChatRequest,
        on_event: Option<&OnEvent>,
    ) -> Result<ChatReply, RuntimeError> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(RuntimeError::EmptyMessage);
        }
        let agent = self.resolve_agent(request.agent_id.as_deref()).await?;
        let origin = SessionOrigin {
            agent_id: agent.id().to_string(),
            channel: request.channel.clone(),
            chat_id: request.chat_id.clone(),
            peer_id: request.peer_id.clone(),
            workspace: None,
        };
        let handle = self.sessions.get_or_create(&origin).await;
        let mut session = handle.lock().await;
        let session_id = session.id.clone();
        self.counters.messages.fetch_add(1, Ordering::Relaxed);

        if let Some(parsed) = ChatCommand::parse(content) {
            self.counters.commands.fetch_add(1, Ordering::Relaxed);
            return Ok(match parsed {
                Ok(command) => {
                    let outcome = command.apply(&mut session);
                    debug!(session_id = %session_id, action = outcome.action, "chat command applied");
                    ChatReply::Command {
                        session_id,
                        outcome,
                    }
                },
                Err(e) => ChatReply::CommandRejected {
                    session_id,
                    error: e.to_string(),
                },
            });
        }

        session.push_message(ChatMessage::user(content));
        agent.record_message();

        if request.group
            && session.settings.activation == ActivationMode::Mention
            && !request.mentioned
        {
            return Ok(ChatReply::Ignored { session_id });
        }

        let Some(ref provider) = self.provider else {
            return Ok(ChatReply::Recorded {
                session_id,
                context_length: session.context.len(),
            });
        };

        let params = RunParams {
            provider: provider.as_ref(),
            agent: &agent,
            tools: &self.tools,
            tool_ctx: ToolContext {
                agent_id: agent.id().to_string(),
                session_id: Some(session_id.clone()),
            },
            timeout: self.provider_timeout,
        };
        self.counters.provider_calls.fetch_add(1, Ordering::Relaxed);
        let run = if request.stream {
            run_streaming(&params, &session.context, on_event).await
        } else {
            run_agent_loop(&params, &session.context, on_event).await
        };

        let result = match run {
            Ok(result) => result,
            Err(e) => {
                self.counters.upstream_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("pincer_upstream_errors_total").increment(1);
                agent.record_error();
                error!(session_id = %session_id, agent_id = %agent.id(), error = %e, "provider call failed");
                return Err(e);
            },
        };

        for message in result.new_messages {
            session.push_message(message);
        }
        session.record_usage(result.usage.total_tokens(), result.usage.cost.unwrap_or(0.0));
        agent.record_tool_calls(result.tool_calls_made as u64);
        self.counters
            .tool_calls
            .fetch_add(result.tool_calls_made as u64, Ordering::Relaxed);

        Ok(ChatReply::Message {
            session_id,
            content: result.text,
            usage: result.usage,
            tool_calls: result.tool_calls_made,
        })
    }

    /// Invoke a tool directly through the approval gate.
    pub async fn execute_tool(
        &self,
        agent_id: Option<&str>,
        name: &str,
        params: serde_json::Value,
        session_id: Option<String>,
    ) -> Result<ToolResult, RuntimeError> {
        let agent = self.resolve_agent(agent_id).await?;
        let ctx = ToolContext {
            agent_id: agent.id().to_string(),
            session_id,
        };
        let outcome = self.tools.execute(name, params, &ctx, agent.policy()).await;
        match outcome {
            Err(ToolError::ApprovalRequired(_)) => {
                self.counters.tool_blocked.fetch_add(1, Ordering::Relaxed);
            },
            Err(ToolError::NotFound(_)) => {},
            _ => {
                self.counters.tool_calls.fetch_add(1, Ordering::Relaxed);
                agent.record_tool_calls(1);
            },
        }
        Ok(ToolResult::from(outcome))
    }

    /// Evict idle sessions. Returns the evicted ids.
    pub async fn sweep_sessions(&self) -> Vec<String> {
        let evicted = self.sessions.sweep_expired().await;
        if !evicted.is_empty() {
            self.counters
                .sessions_evicted
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            metrics::counter!("pincer_sessions_evicted_total").increment(evicted.len() as u64);
            for id in &evicted {
                warn!(session_id = %id, "session expired");
            }
        }
        evicted
    }

    pub fn stats(&self) -> RuntimeStats {
        let c = &self.counters;
        RuntimeStats {
            messages: c.messages.load(Ordering::Relaxed),
            commands: c.commands.load(Ordering::Relaxed),
            provider_calls: c.provider_calls.load(Ordering::Relaxed),
            upstream_errors: c.upstream_errors.load(Ordering::Relaxed),
            tool_calls: c.tool_calls.load(Ordering::Relaxed),
            tool_blocked: c.tool_blocked.load(Ordering::Relaxed),
            sessions_evicted: c.sessions_evicted.load(Ordering::Relaxed),
        }
    }
}
