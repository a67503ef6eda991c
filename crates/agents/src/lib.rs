//! Agent runtime: provider abstraction, gated tool execution, the tool-call
//! loop, and the runtime that ties agents to sessions.

pub mod agent;
pub mod builtin_tools;
pub mod model;
pub mod runner;
pub mod runtime;
pub mod tool_policy;
pub mod tool_registry;

pub use {
    agent::{Agent, AgentConfig, AgentInfo},
    model::{ChatOptions, ChatProvider, ChatResponse, ProviderError, StreamEvent, ToolCall, Usage},
    runtime::{AgentRuntime, ChatReply, ChatRequest, RuntimeError, RuntimeStats},
    tool_policy::ToolPolicy,
    tool_registry::{AgentTool, ToolContext, ToolError, ToolRegistry, ToolResult},
};
