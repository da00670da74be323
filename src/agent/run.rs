//! One end-to-end agent run.
//!
//! [`AgentRun::execute`] initializes a fresh sandbox, streams one runtime
//! session, turns each message into ordered [`AgentEvent`]s and builds the
//! final report. The sandbox is torn down on every exit path.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, SandboxConfig};
use crate::error::{AgentError, Error, Result};
use crate::github::{Issue, Repository};
use crate::prompt;
use crate::runtime::{
    AgentMessage, AgentRuntime, AssistantBlock, McpServer, ResultSubtype, SessionRequest,
};
use crate::sandbox::{GatewayInfo, SandboxProvider, SandboxSession};
use crate::tools::{QuestionBroker, ToolCatalogue, DEFAULT_PREVIEW_PORT};

use super::events::{AgentEvent, EventSink, Phase};
use super::report::{build_report, AgentReport, ReportInput};

/// Name of the browser MCP server handed to the runtime.
pub const GATEWAY_SERVER_NAME: &str = "playwright";

/// What the stream left behind for the report.
#[derive(Debug, Default)]
struct Captured {
    result_text: Option<String>,
    last_text: String,
    is_error: bool,
    turns: u32,
    cost_usd: f64,
    preview_url: Option<String>,
}

/// A single run. Consumed by [`execute`](AgentRun::execute).
pub struct AgentRun {
    runtime: Arc<dyn AgentRuntime>,
    provider: Arc<dyn SandboxProvider>,
    agent: AgentConfig,
    sandbox: SandboxConfig,
    sink: Option<EventSink>,
    broker: Option<Arc<QuestionBroker>>,
}

impl AgentRun {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        provider: Arc<dyn SandboxProvider>,
        agent: AgentConfig,
        sandbox: SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            provider,
            agent,
            sandbox,
            sink: None,
            broker: None,
        }
    }

    /// Routes events to `sink` and enables `ask_user` through a broker bound to it.
    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.broker = Some(Arc::new(QuestionBroker::new(sink.clone())));
        self.sink = Some(sink);
        self
    }

    /// Broker for answering `ask_user` events. `None` without a sink.
    pub fn questions(&self) -> Option<Arc<QuestionBroker>> {
        self.broker.clone()
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    /// Drives the run to a report.
    ///
    /// On failure or cancellation, pending questions are rejected, one
    /// `error` event is emitted and no report is produced. `complete` is the
    /// last event of a successful run.
    pub async fn execute(
        self,
        issue: &Issue,
        repository: &Repository,
        cancel: CancellationToken,
    ) -> Result<AgentReport> {
        let started = Instant::now();
        let session = Arc::new(SandboxSession::new(
            self.provider.clone(),
            self.sandbox.clone(),
        ));
        let tools = Arc::new(ToolCatalogue::new(session.clone(), self.broker.clone()));

        tracing::info!(
            issue = issue.number,
            repository = %repository.full_name(),
            model = %self.agent.model,
            provider = %self.provider.name(),
            "starting agent run"
        );

        let result = self
            .drive(&session, tools, issue, repository, &cancel)
            .await;

        if let Err(e) = &result {
            if let Some(broker) = &self.broker {
                broker.reject_all();
            }
            tracing::error!(error = %e, "agent run failed");
            self.emit(AgentEvent::Error {
                message: e.user_message(),
            });
        }

        session.cleanup().await;

        let captured = result?;
        let report = build_report(ReportInput {
            text: captured.result_text.unwrap_or(captured.last_text),
            is_error: captured.is_error,
            turns: captured.turns,
            duration: started.elapsed(),
            cost_usd: captured.cost_usd,
            preview_url: captured.preview_url,
            issue: issue.clone(),
            repository: repository.clone(),
        });

        tracing::info!(
            status = report.status.name(),
            turns = report.turns,
            cost_usd = report.cost_usd,
            duration_secs = report.duration.as_secs(),
            "agent run complete"
        );
        self.emit(AgentEvent::Complete {
            report: Box::new(report.clone()),
        });
        Ok(report)
    }

    async fn drive(
        &self,
        session: &SandboxSession,
        tools: Arc<ToolCatalogue>,
        issue: &Issue,
        repository: &Repository,
        cancel: &CancellationToken,
    ) -> Result<Captured> {
        self.emit(AgentEvent::phase(Phase::Initializing));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            init = session.initialize() => { init?; }
        }

        let mcp_servers: Vec<McpServer> = session
            .gateway()
            .filter(|_| self.sandbox.enable_browser)
            .and_then(gateway_server)
            .into_iter()
            .collect();

        let request = SessionRequest {
            model: self.agent.model.clone(),
            system_prompt: prompt::system_prompt(self.sandbox.enable_browser),
            prompt: prompt::format_issue_prompt(issue, repository),
            thinking_budget: self.agent.thinking_budget,
            max_turns: self.agent.max_turns,
            mcp_servers,
        };

        let mut agent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            opened = self.runtime.open(request, tools) => opened?,
        };
        self.emit(AgentEvent::phase(Phase::Exploring));

        let mut captured = Captured::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = agent.next_message() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(message)) => self.dispatch(message, &mut captured),
            }
        }

        captured.preview_url = session.host_url(DEFAULT_PREVIEW_PORT);
        Ok(captured)
    }

    /// Emits the events for one message, in block order.
    fn dispatch(&self, message: AgentMessage, captured: &mut Captured) {
        match message {
            AgentMessage::System { session_id, model } => {
                tracing::debug!(session_id = %session_id, model = %model, "agent session started");
            }
            AgentMessage::Assistant(blocks) => {
                captured.turns += 1;
                self.emit(AgentEvent::TurnComplete {
                    turn: captured.turns,
                });
                for block in blocks {
                    match block {
                        AssistantBlock::Thinking(text) => self.emit(AgentEvent::Thinking {
                            text,
                            partial: false,
                        }),
                        AssistantBlock::Text(text) => {
                            let (phases, remaining) = split_phase_markers(&text);
                            for phase in phases {
                                self.emit(AgentEvent::phase(phase));
                            }
                            if !remaining.trim().is_empty() {
                                captured.last_text = remaining.clone();
                                self.emit(AgentEvent::Message {
                                    text: remaining,
                                    partial: false,
                                });
                            }
                        }
                        AssistantBlock::ToolUse { id, name, input } => {
                            self.emit(AgentEvent::ToolCall { id, name, input })
                        }
                    }
                }
            }
            AgentMessage::PartialText(text) => {
                if self.agent.interactive {
                    self.emit(AgentEvent::Message {
                        text,
                        partial: true,
                    });
                }
            }
            AgentMessage::PartialThinking(text) => {
                if self.agent.interactive {
                    self.emit(AgentEvent::Thinking {
                        text,
                        partial: true,
                    });
                }
            }
            AgentMessage::ToolResults(results) => {
                for result in results {
                    self.emit(AgentEvent::ToolResult {
                        success: result.response.succeeded(),
                        output: result.response.text(),
                        id: result.tool_use_id,
                        name: result.name,
                    });
                }
            }
            AgentMessage::Result(outcome) => {
                if outcome.subtype == ResultSubtype::MaxTurns {
                    tracing::warn!(error = %AgentError::MaxTurns(outcome.turns), "agent stopped early");
                }
                captured.result_text = Some(outcome.text);
                captured.is_error = outcome.is_error;
                captured.cost_usd = outcome.cost_usd;
            }
        }
    }
}

/// The gateway as an MCP server for the runtime.
///
/// MCP connectors are called from the API side, so a gateway only reachable
/// on this host's loopback is not forwarded; `sandbox_browser` still works.
fn gateway_server(gateway: GatewayInfo) -> Option<McpServer> {
    if is_loopback_url(&gateway.url) {
        tracing::warn!(url = %gateway.url, "automation gateway is only reachable locally, not forwarding it");
        return None;
    }
    Some(McpServer {
        name: GATEWAY_SERVER_NAME.to_string(),
        url: gateway.url,
        authorization_token: gateway.token,
    })
}

/// True for loopback or unspecified hosts, and for URLs that do not parse.
fn is_loopback_url(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return true;
    };
    let host = match parsed.host_str() {
        Some(host) => host.trim_start_matches('[').trim_end_matches(']'),
        None => return true,
    };
    if host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

fn phase_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^\s*\[phase:\s*([a-z_ -]+?)\s*\]\s*$").expect("static regex")
    })
}

/// Pulls `[phase: <name>]` lines out of agent text. Unknown names stay in the text.
fn split_phase_markers(text: &str) -> (Vec<Phase>, String) {
    let mut phases = Vec::new();
    let mut kept = Vec::new();
    for line in text.lines() {
        match phase_marker().captures(line) {
            Some(caps) => match caps[1].parse::<Phase>() {
                Ok(phase) => phases.push(phase),
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring phase marker");
                    kept.push(line);
                }
            },
            None => kept.push(line),
        }
    }
    if phases.is_empty() {
        return (phases, text.to_string());
    }
    (phases, kept.join("\n").trim().to_string())
}
