use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::{model::ChatOptions, tool_policy::ToolPolicy};

pub const DEFAULT_AGENT_ID: &str = "main";

/// Static agent definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: ToolPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_AGENT_ID.into(),
            name: None,
            model: None,
            provider: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            tools: ToolPolicy::default(),
        }
    }
}

/// A live agent: its definition plus status counters.
#[derive(Debug)]
pub struct Agent {
    pub config: AgentConfig,
    messages: AtomicU64,
    tool_calls: AtomicU64,
    errors: AtomicU64,
}

/// Serializable view for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tools: ToolPolicy,
    pub messages: u64,
    pub tool_calls: u64,
    pub errors: u64,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            messages: AtomicU64::new(0),
            tool_calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn policy(&self) -> &ToolPolicy {
        &self.config.tools
    }

    pub fn chat_options(&self, tools: Vec<serde_json::Value>) -> ChatOptions {
        ChatOptions {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            tools,
        }
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_calls(&self, n: u64) {
        self.tool_calls.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.config.id.clone(),
            name: self
                .config
                .name
                .clone()
                .unwrap_or_else(|| self.config.id.clone()),
            model: self.config.model.clone(),
            provider: self.config.provider.clone(),
            tools: self.config.tools.clone(),
            messages: self.messages.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
