//! Agent runtime seam.
//!
//! An [`AgentRuntime`] opens one streaming [`AgentSession`] per run. The
//! session is pull-based: tools requested by the model are executed inside
//! [`AgentSession::next_message`], so every message is yielded in the order
//! its cause happened.

pub mod anthropic;
pub mod sse;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;
use crate::tools::{ToolCatalogue, ToolResponse};

pub use anthropic::AnthropicRuntime;

/// Remote MCP server made available to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_token: Option<String>,
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub model: String,
    pub system_prompt: String,
    /// First user message.
    pub prompt: String,
    pub thinking_budget: u32,
    pub max_turns: Option<u32>,
    pub mcp_servers: Vec<McpServer>,
}

/// One content block of an assistant turn, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantBlock {
    Text(String),
    Thinking(String),
    ToolUse { id: String, name: String, input: Value },
}

/// The outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub name: String,
    pub response: ToolResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    MaxTurns,
    Error,
}

/// Final summary of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub subtype: ResultSubtype,
    pub is_error: bool,
    /// Text of the last assistant turn.
    pub text: String,
    pub turns: u32,
    pub cost_usd: f64,
}

/// A message pulled from a session.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    System { session_id: String, model: String },
    Assistant(Vec<AssistantBlock>),
    PartialText(String),
    PartialThinking(String),
    ToolResults(Vec<ToolResultBlock>),
    Result(RunOutcome),
}

/// Opens agent sessions.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn open(
        &self,
        request: SessionRequest,
        tools: Arc<ToolCatalogue>,
    ) -> Result<Box<dyn AgentSession>, AgentError>;
}

/// A live session. `None` means the stream has ended.
#[async_trait]
pub trait AgentSession: Send {
    async fn next_message(&mut self) -> Option<Result<AgentMessage, AgentError>>;
}
