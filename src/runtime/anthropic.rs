//! Anthropic Messages API runtime.
//!
//! Streams each turn over SSE with extended thinking enabled. When a turn
//! stops for `tool_use`, the next pull runs the requested tools through the
//! catalogue and the following pull opens the next turn.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::backoff::{is_retryable_status, ExponentialBackoff};
use crate::error::AgentError;
use crate::tools::{ContentBlock, ToolCatalogue, ToolResponse};

use super::sse::{SseStreamParser, StreamEvent};
use super::{
    AgentMessage, AgentRuntime, AgentSession, AssistantBlock, ResultSubtype, RunOutcome,
    SessionRequest, ToolResultBlock,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MCP_BETA: &str = "mcp-client-2025-04-04";

/// Tokens allowed for visible output on top of the thinking budget.
const OUTPUT_HEADROOM: u32 = 8192;

/// USD per million (input, output) tokens.
fn price_per_mtok(model: &str) -> (f64, f64) {
    let model = model.to_ascii_lowercase();
    if model.contains("opus") {
        (15.0, 75.0)
    } else if model.contains("haiku-4") {
        (1.0, 5.0)
    } else if model.contains("haiku") {
        (0.8, 4.0)
    } else {
        (3.0, 15.0)
    }
}

/// Output ceiling for a turn: the thinking budget plus room for the answer.
fn max_tokens(thinking_budget: u32) -> u32 {
    thinking_budget.saturating_add(OUTPUT_HEADROOM)
}

pub fn cost_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input, output) = price_per_mtok(model);
    (input_tokens as f64 * input + output_tokens as f64 * output) / 1_000_000.0
}

#[derive(Clone)]
struct ApiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    backoff: ExponentialBackoff,
}

impl ApiClient {
    /// POSTs `body`, retrying retryable statuses and connection failures.
    async fn send(&self, body: &Value, beta: Option<&str>) -> Result<reqwest::Response, AgentError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let mut backoff = self.backoff.clone();
        backoff.reset();

        loop {
            let mut request = self
                .http
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(body);
            if let Some(beta) = beta {
                request = request.header("anthropic-beta", beta);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    if is_retryable_status(status) {
                        if let Some(delay) = backoff.next_delay() {
                            tracing::warn!(status, attempt = backoff.attempts(), delay_ms = delay.as_millis() as u64, "LLM API request failed, retrying");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    return Err(AgentError::Api {
                        status,
                        message: api_error_message(&text),
                    });
                }
                Err(e) if e.is_connect() || e.is_timeout() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(error = %e, attempt = backoff.attempts(), "LLM API unreachable, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(AgentError::Stream(e.to_string())),
                },
                Err(e) => return Err(AgentError::Stream(e.to_string())),
            }
        }
    }
}

/// Extracts `error.message` from an API error body, else a truncated body.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Runtime backed by the Anthropic Messages API.
pub struct AnthropicRuntime {
    client: ApiClient,
}

impl AnthropicRuntime {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: ApiClient {
                http: reqwest::Client::new(),
                api_key: api_key.into(),
                base_url: DEFAULT_BASE_URL.to_string(),
                backoff: ExponentialBackoff::default(),
            },
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.client.base_url = base_url.into();
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.client.backoff = backoff;
        self
    }
}

#[async_trait]
impl AgentRuntime for AnthropicRuntime {
    async fn open(
        &self,
        request: SessionRequest,
        tools: Arc<ToolCatalogue>,
    ) -> Result<Box<dyn AgentSession>, AgentError> {
        let tool_defs = serde_json::to_value(tools.definitions())
            .map_err(|e| AgentError::Stream(format!("cannot encode tool definitions: {}", e)))?;
        let history = vec![json!({ "role": "user", "content": request.prompt })];
        let session_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(
            session_id = %session_id,
            model = %request.model,
            max_turns = ?request.max_turns,
            mcp_servers = request.mcp_servers.len(),
            "opened agent session"
        );

        Ok(Box::new(AnthropicSession {
            client: self.client.clone(),
            request,
            tools,
            tool_defs,
            history,
            session_id,
            stage: Stage::Handshake,
            queue: VecDeque::new(),
            turns: 0,
            cost_usd: 0.0,
            last_text: String::new(),
        }))
    }
}

/// A tool call waiting to run.
#[derive(Debug, Clone)]
struct PendingTool {
    id: String,
    name: String,
    input: Value,
}

#[derive(Debug)]
enum BlockState {
    Text(String),
    Thinking { thinking: String, signature: String },
    RedactedThinking(Value),
    ToolUse { id: String, name: String, json: String },
    /// Server-side blocks (MCP calls and results) kept for history only.
    Other { raw: Value, json: String },
}

/// Accumulates one streamed assistant turn.
#[derive(Debug, Default)]
struct TurnBuilder {
    blocks: BTreeMap<usize, BlockState>,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    stopped: bool,
}

/// A finished turn: surfaced blocks, replayable content, and tool calls.
struct FinishedTurn {
    blocks: Vec<AssistantBlock>,
    content: Vec<Value>,
    tool_calls: Vec<PendingTool>,
    stop_reason: Option<String>,
}

impl TurnBuilder {
    fn start_block(&mut self, index: usize, block: Value) {
        let state = match block.get("type").and_then(Value::as_str) {
            Some("text") => BlockState::Text(
                block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            ),
            Some("thinking") => BlockState::Thinking {
                thinking: block
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                signature: String::new(),
            },
            Some("redacted_thinking") => BlockState::RedactedThinking(block),
            Some("tool_use") => BlockState::ToolUse {
                id: block.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                name: block.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                json: String::new(),
            },
            _ => BlockState::Other {
                raw: block,
                json: String::new(),
            },
        };
        self.blocks.insert(index, state);
    }

    fn finish(self) -> FinishedTurn {
        let mut blocks = Vec::new();
        let mut content = Vec::new();
        let mut tool_calls = Vec::new();

        for (_, state) in self.blocks {
            match state {
                BlockState::Text(text) => {
                    content.push(json!({ "type": "text", "text": text }));
                    blocks.push(AssistantBlock::Text(text));
                }
                BlockState::Thinking { thinking, signature } => {
                    content.push(json!({ "type": "thinking", "thinking": thinking, "signature": signature }));
                    blocks.push(AssistantBlock::Thinking(thinking));
                }
                BlockState::RedactedThinking(raw) => content.push(raw),
                BlockState::ToolUse { id, name, json } => {
                    let input = parse_tool_input(&json);
                    content.push(json!({ "type": "tool_use", "id": id, "name": name, "input": input }));
                    blocks.push(AssistantBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    tool_calls.push(PendingTool { id, name, input });
                }
                BlockState::Other { mut raw, json } => {
                    if !json.is_empty() {
                        if let Some(obj) = raw.as_object_mut() {
                            obj.insert("input".to_string(), parse_tool_input(&json));
                        }
                    }
                    content.push(raw);
                }
            }
        }

        FinishedTurn {
            blocks,
            content,
            tool_calls,
            stop_reason: self.stop_reason,
        }
    }
}

fn parse_tool_input(json: &str) -> Value {
    if json.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(json).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "tool input was not valid JSON");
        json!({})
    })
}

/// Tool response in `tool_result` content form.
fn tool_result_content(response: &ToolResponse) -> Vec<Value> {
    response
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
            ContentBlock::Image { data, mime_type } => json!({
                "type": "image",
                "source": { "type": "base64", "media_type": mime_type, "data": data }
            }),
        })
        .collect()
}

struct ActiveTurn {
    stream: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    parser: SseStreamParser,
    builder: TurnBuilder,
}

enum Stage {
    Handshake,
    NextTurn,
    Streaming(Box<ActiveTurn>),
    RunTools(Vec<PendingTool>),
    Finished,
}

struct AnthropicSession {
    client: ApiClient,
    request: SessionRequest,
    tools: Arc<ToolCatalogue>,
    tool_defs: Value,
    /// Conversation replayed on every turn, thinking signatures included.
    history: Vec<Value>,
    session_id: String,
    stage: Stage,
    queue: VecDeque<AgentMessage>,
    turns: u32,
    cost_usd: f64,
    last_text: String,
}

impl AnthropicSession {
    fn request_body(&self) -> Value {
        let mut body = json!({
            "model": self.request.model,
            "max_tokens": max_tokens(self.request.thinking_budget),
            "system": self.request.system_prompt,
            "messages": self.history,
            "tools": self.tool_defs,
            "stream": true,
            "thinking": { "type": "enabled", "budget_tokens": self.request.thinking_budget },
        });
        if !self.request.mcp_servers.is_empty() {
            let servers: Vec<Value> = self
                .request
                .mcp_servers
                .iter()
                .map(|s| {
                    let mut server = json!({ "type": "url", "name": s.name, "url": s.url });
                    if let Some(token) = &s.authorization_token {
                        server["authorization_token"] = json!(token);
                    }
                    server
                })
                .collect();
            body["mcp_servers"] = Value::Array(servers);
        }
        body
    }

    fn beta_header(&self) -> Option<&'static str> {
        (!self.request.mcp_servers.is_empty()).then_some(MCP_BETA)
    }

    async fn start_turn(&mut self) -> Result<ActiveTurn, AgentError> {
        tracing::debug!(session_id = %self.session_id, turn = self.turns + 1, "requesting turn");
        let response = self
            .client
            .send(&self.request_body(), self.beta_header())
            .await?;
        Ok(ActiveTurn {
            stream: response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed(),
            parser: SseStreamParser::default(),
            builder: TurnBuilder::default(),
        })
    }

    fn apply(&mut self, builder: &mut TurnBuilder, event: StreamEvent) -> Result<(), AgentError> {
        match event {
            StreamEvent::MessageStart {
                input_tokens,
                output_tokens,
            } => {
                builder.input_tokens = input_tokens;
                builder.output_tokens = output_tokens;
            }
            StreamEvent::BlockStart { index, block } => builder.start_block(index, block),
            StreamEvent::TextDelta { index, text } => {
                if let Some(BlockState::Text(buf)) = builder.blocks.get_mut(&index) {
                    buf.push_str(&text);
                }
                self.queue.push_back(AgentMessage::PartialText(text));
            }
            StreamEvent::ThinkingDelta { index, thinking } => {
                if let Some(BlockState::Thinking { thinking: buf, .. }) = builder.blocks.get_mut(&index) {
                    buf.push_str(&thinking);
                }
                self.queue.push_back(AgentMessage::PartialThinking(thinking));
            }
            StreamEvent::SignatureDelta { index, signature } => {
                if let Some(BlockState::Thinking { signature: buf, .. }) = builder.blocks.get_mut(&index) {
                    buf.push_str(&signature);
                }
            }
            StreamEvent::InputJsonDelta {
                index,
                partial_json,
            } => match builder.blocks.get_mut(&index) {
                Some(BlockState::ToolUse { json, .. }) | Some(BlockState::Other { json, .. }) => {
                    json.push_str(&partial_json)
                }
                _ => {}
            },
            StreamEvent::BlockStop { .. } => {}
            StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => {
                if stop_reason.is_some() {
                    builder.stop_reason = stop_reason;
                }
                if let Some(tokens) = output_tokens {
                    builder.output_tokens = tokens;
                }
            }
            StreamEvent::MessageStop => builder.stopped = true,
            StreamEvent::Error { message } => return Err(AgentError::Stream(message)),
        }
        Ok(())
    }

    fn finish_turn(&mut self, builder: TurnBuilder) {
        self.turns += 1;
        self.cost_usd += cost_usd(&self.request.model, builder.input_tokens, builder.output_tokens);

        let turn = builder.finish();
        let text: Vec<&str> = turn
            .blocks
            .iter()
            .filter_map(|b| match b {
                AssistantBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        if !text.is_empty() {
            self.last_text = text.join("\n");
        }

        tracing::debug!(
            session_id = %self.session_id,
            turn = self.turns,
            stop_reason = ?turn.stop_reason,
            tool_calls = turn.tool_calls.len(),
            "turn finished"
        );

        self.history
            .push(json!({ "role": "assistant", "content": turn.content }));
        self.queue.push_back(AgentMessage::Assistant(turn.blocks));

        match turn.stop_reason.as_deref() {
            Some("tool_use") if !turn.tool_calls.is_empty() => {
                self.stage = Stage::RunTools(turn.tool_calls);
            }
            Some("pause_turn") => self.stage = Stage::NextTurn,
            _ => {
                self.queue
                    .push_back(AgentMessage::Result(self.outcome(ResultSubtype::Success)));
                self.stage = Stage::Finished;
            }
        }
    }

    fn outcome(&self, subtype: ResultSubtype) -> RunOutcome {
        RunOutcome {
            subtype,
            is_error: subtype != ResultSubtype::Success,
            text: self.last_text.clone(),
            turns: self.turns,
            cost_usd: self.cost_usd,
        }
    }

    async fn run_tools(&mut self, calls: Vec<PendingTool>) -> AgentMessage {
        let mut results = Vec::with_capacity(calls.len());
        let mut content = Vec::with_capacity(calls.len());

        for call in calls {
            let response = self.tools.invoke(&call.name, call.input).await;
            content.push(json!({
                "type": "tool_result",
                "tool_use_id": call.id,
                "content": tool_result_content(&response),
                "is_error": response.is_error,
            }));
            results.push(ToolResultBlock {
                tool_use_id: call.id,
                name: call.name,
                response,
            });
        }

        self.history.push(json!({ "role": "user", "content": content }));
        AgentMessage::ToolResults(results)
    }
}

#[async_trait]
impl AgentSession for AnthropicSession {
    async fn next_message(&mut self) -> Option<Result<AgentMessage, AgentError>> {
        loop {
            if let Some(message) = self.queue.pop_front() {
                return Some(Ok(message));
            }

            match std::mem::replace(&mut self.stage, Stage::Finished) {
                Stage::Handshake => {
                    self.stage = Stage::NextTurn;
                    return Some(Ok(AgentMessage::System {
                        session_id: self.session_id.clone(),
                        model: self.request.model.clone(),
                    }));
                }
                Stage::NextTurn => {
                    if let Some(limit) = self.request.max_turns {
                        if self.turns >= limit {
                            tracing::warn!(session_id = %self.session_id, limit, "turn ceiling reached");
                            self.queue
                                .push_back(AgentMessage::Result(self.outcome(ResultSubtype::MaxTurns)));
                            continue;
                        }
                    }
                    match self.start_turn().await {
                        Ok(active) => self.stage = Stage::Streaming(Box::new(active)),
                        Err(e) => return Some(Err(e)),
                    }
                }
                Stage::Streaming(mut active) => match active.stream.next().await {
                    Some(Ok(bytes)) => {
                        for event in active.parser.feed(&bytes) {
                            if let Err(e) = self.apply(&mut active.builder, event) {
                                return Some(Err(e));
                            }
                        }
                        if active.builder.stopped {
                            let ActiveTurn { builder, .. } = *active;
                            self.finish_turn(builder);
                        } else {
                            self.stage = Stage::Streaming(active);
                        }
                    }
                    Some(Err(e)) => return Some(Err(AgentError::Stream(e.to_string()))),
                    None => {
                        return Some(Err(AgentError::Stream(
                            "stream closed before the turn finished".to_string(),
                        )))
                    }
                },
                Stage::RunTools(calls) => {
                    let message = self.run_tools(calls).await;
                    self.stage = Stage::NextTurn;
                    return Some(Ok(message));
                }
                Stage::Finished => return None,
            }
        }
    }
}
