use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

pub const DEFAULT_MAX_CONTEXT_MESSAGES: usize = 50;

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(rename = "toolCallId", default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(rename = "toolCalls", default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// Provider wire shape (`role`, `content`, optional tool fields).
    pub fn to_provider_json(&self) -> serde_json::Value {
        let mut msg = serde_json::json!({
            "role": self.role,
            "content": self.content,
        });
        if let Some(ref id) = self.tool_call_id {
            msg["tool_call_id"] = serde_json::json!(id);
        }
        if let Some(ref calls) = self.tool_calls {
            msg["tool_calls"] = calls.clone();
        }
        msg
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageMode {
    #[default]
    Off,
    Tokens,
    Full,
}

/// How the agent reacts in group chats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    #[default]
    Mention,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    pub thinking: ThinkingLevel,
    pub verbose: bool,
    pub usage: UsageMode,
    pub activation: ActivationMode,
    pub max_context_messages: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            thinking: ThinkingLevel::default(),
            verbose: false,
            usage: UsageMode::default(),
            activation: ActivationMode::default(),
            max_context_messages: DEFAULT_MAX_CONTEXT_MESSAGES,
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub channel: String,
    pub channel_id: String,
    pub peer_id: Option<String>,
    pub workspace: Option<String>,
    pub agent_id: String,
    pub context: Vec<ChatMessage>,
    pub message_count: u64,
    pub token_count: u64,
    pub cost_total: f64,
    pub settings: SessionSettings,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Session metadata without the context window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub channel: String,
    pub channel_id: String,
    pub peer_id: Option<String>,
    pub agent_id: String,
    pub context_length: usize,
    pub message_count: u64,
    pub token_count: u64,
    pub cost_total: f64,
    pub settings: SessionSettings,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        channel: impl Into<String>,
        channel_id: impl Into<String>,
        settings: SessionSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            channel: channel.into(),
            channel_id: channel_id.into(),
            peer_id: None,
            workspace: None,
            agent_id: agent_id.into(),
            context: Vec::new(),
            message_count: 0,
            token_count: 0,
            cost_total: 0.0,
            settings,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Whether the session has been idle for longer than `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_activity) > ttl
    }

    /// Append a message and enforce the context bound.
    pub fn push_message(&mut self, message: ChatMessage) {
        if !message.is_system() {
            self.message_count += 1;
        }
        self.context.push(message);
        self.trim_context();
        self.touch();
    }

    /// Keep every system message plus the most recent
    /// `max - system_count` non-system messages, in arrival order.
    ///
    /// System messages are never dropped, so a context holding more system
    /// messages than the bound keeps only those.
    pub fn trim_context(&mut self) {
        let max = self.settings.max_context_messages;
        if self.context.len() <= max {
            return;
        }
        let system_count = self.context.iter().filter(|m| m.is_system()).count();
        let keep_non_system = max.saturating_sub(system_count);
        self.retain_recent_non_system(keep_non_system);
    }

    fn retain_recent_non_system(&mut self, keep: usize) -> usize {
        let non_system = self.context.iter().filter(|m| !m.is_system()).count();
        let mut to_drop = non_system.saturating_sub(keep);
        let dropped = to_drop;
        self.context.retain(|m| {
            if to_drop > 0 && !m.is_system() {
                to_drop -= 1;
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Empty the context window. Counters and settings survive.
    pub fn reset(&mut self) {
        self.context.clear();
        self.touch();
    }

    /// Drop all but the `keep` most recent non-system messages.
    /// Returns the number of messages removed.
    pub fn compact(&mut self, keep: usize) -> usize {
        let removed = self.retain_recent_non_system(keep);
        self.touch();
        removed
    }

    pub fn record_usage(&mut self, tokens: u64, cost: f64) {
        self.token_count += tokens;
        self.cost_total += cost;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            channel: self.channel.clone(),
            channel_id: self.channel_id.clone(),
            peer_id: self.peer_id.clone(),
            agent_id: self.agent_id.clone(),
            context_length: self.context.len(),
            message_count: self.message_count,
            token_count: self.token_count,
            cost_total: self.cost_total,
            settings: self.settings.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}
