use std::{collections::HashMap, sync::Arc};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::Serialize,
    thiserror::Error,
    tracing::{debug, warn},
};

use crate::tool_policy::ToolPolicy;

/// Who is calling a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub agent_id: String,
    pub session_id: Option<String>,
}

/// Agent-callable tool.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Tools that touch the host (shell, filesystem) opt into the approval gate.
    fn requires_approval(&self) -> bool {
        false
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<serde_json::Value>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("tool '{0}' is disabled for this agent")]
    Disabled(String),
    #[error("tool '{0}' requires approval")]
    ApprovalRequired(String),
    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

/// `{success, data | error}` as returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_approval: bool,
}

impl From<Result<serde_json::Value, ToolError>> for ToolResult {
    fn from(result: Result<serde_json::Value, ToolError>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
                requires_approval: false,
            },
            Err(err) => Self {
                success: false,
                data: None,
                requires_approval: matches!(err, ToolError::ApprovalRequired(_)),
                error: Some(err.to_string()),
            },
        }
    }
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
    /// Gateway-wide approval list, checked in addition to each tool's own flag.
    global_policy: ToolPolicy,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            global_policy: ToolPolicy::default(),
        }
    }

    pub fn with_global_policy(mut self, policy: ToolPolicy) -> Self {
        self.global_policy = policy;
        self
    }

    pub fn global_policy(&self) -> &ToolPolicy {
        &self.global_policy
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn AgentTool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` is approval-gated globally (tool flag or gateway
    /// policy) or by `agent_policy`.
    pub fn requires_approval(&self, name: &str, agent_policy: &ToolPolicy) -> bool {
        self.tools.get(name).is_some_and(|t| t.requires_approval())
            || self.global_policy.requires_approval(name)
            || agent_policy.requires_approval(name)
    }

    /// Schemas of the tools `agent_policy` lets the agent use.
    pub fn list_schemas(&self, agent_policy: &ToolPolicy) -> Vec<serde_json::Value> {
        let effective = self.global_policy.merge_with(agent_policy);
        let mut schemas: Vec<_> = self
            .tools
            .values()
            .filter(|t| effective.is_enabled(t.name()))
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect();
        schemas.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        schemas
    }

    /// Descriptions for listing, including the approval flag.
    pub fn describe(&self, agent_policy: &ToolPolicy) -> Vec<serde_json::Value> {
        let mut list: Vec<_> = self
            .tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "enabled": self.global_policy.merge_with(agent_policy).is_enabled(t.name()),
                    "requiresApproval": self.requires_approval(t.name(), agent_policy),
                })
            })
            .collect();
        list.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        list
    }

    /// Run a tool through the policy and approval gate.
    ///
    /// The handler is never invoked for a disabled or approval-gated tool.
    pub async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
        ctx: &ToolContext,
        agent_policy: &ToolPolicy,
    ) -> Result<serde_json::Value, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ToolError::NotFound(name.to_string()));
        };
        if !self.global_policy.merge_with(agent_policy).is_enabled(name) {
            return Err(ToolError::Disabled(name.to_string()));
        }
        if self.requires_approval(name, agent_policy) {
            warn!(tool = name, agent_id = %ctx.agent_id, "tool call blocked pending approval");
            return Err(ToolError::ApprovalRequired(name.to_string()));
        }

        debug!(tool = name, agent_id = %ctx.agent_id, "executing tool");
        metrics::counter!("pincer_tool_calls_total", "tool" => name.to_string()).increment(1);
        tool.execute(params, ctx)
            .await
            .map_err(|e| ToolError::Failed {
                tool: name.to_string(),
                message: e.to_string(),
            })
    }
}
