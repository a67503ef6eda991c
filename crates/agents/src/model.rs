use std::{pin::Pin, time::Duration};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    thiserror::Error,
    tokio_stream::Stream,
};

/// Events emitted during streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(String),
    Done(Usage),
    Error(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request timed out after {0}ms")]
    Timeout(u64),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider error: {0}")]
    Upstream(String),
}

impl ProviderError {
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout(u64::try_from(after.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Generation options passed with every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Tool schemas the model may call.
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
}

/// Model backend (Anthropic, OpenAI, a local model, ...).
///
/// Messages use the provider wire shape produced by
/// `ChatMessage::to_provider_json`.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[serde_json::Value],
        options: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError>;

    /// Stream a completion, yielding delta/done/error events.
    fn stream(
        &self,
        messages: Vec<serde_json::Value>,
        options: ChatOptions,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>>;
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cost = match (self.cost, other.cost) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
    }
}
