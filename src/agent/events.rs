//! Events emitted by an agent run.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::report::AgentReport;

/// Advisory label for what the agent is doing. Not a validated state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    Exploring,
    Reproducing,
    Investigating,
    Fixing,
    Validating,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::Exploring => "exploring",
            Phase::Reproducing => "reproducing",
            Phase::Investigating => "investigating",
            Phase::Fixing => "fixing",
            Phase::Validating => "validating",
            Phase::Completed => "completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initializing" => Ok(Phase::Initializing),
            "exploring" => Ok(Phase::Exploring),
            "reproducing" => Ok(Phase::Reproducing),
            "investigating" | "bisecting" => Ok(Phase::Investigating),
            "fixing" => Ok(Phase::Fixing),
            "validating" | "verifying" => Ok(Phase::Validating),
            "completed" | "done" => Ok(Phase::Completed),
            other => Err(format!("unknown phase: {}", other)),
        }
    }
}

/// One event of a run, in the order its cause occurred.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    PhaseChange {
        phase: Phase,
        at: DateTime<Utc>,
    },
    TurnComplete {
        turn: u32,
    },
    /// `id` is the runtime's tool-use id; the matching result carries the same id.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        success: bool,
        output: String,
    },
    Thinking {
        text: String,
        partial: bool,
    },
    Message {
        text: String,
        partial: bool,
    },
    /// Answer with [`QuestionBroker::answer`](crate::tools::QuestionBroker::answer) using `id`.
    AskUser {
        id: String,
        question: String,
        options: Vec<String>,
    },
    Error {
        message: String,
    },
    Complete {
        report: Box<AgentReport>,
    },
}

impl AgentEvent {
    pub fn phase(phase: Phase) -> Self {
        AgentEvent::PhaseChange {
            phase,
            at: Utc::now(),
        }
    }

    /// Wire name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::PhaseChange { .. } => "phase_change",
            AgentEvent::TurnComplete { .. } => "turn_complete",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::Message { .. } => "message",
            AgentEvent::AskUser { .. } => "ask_user",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Complete { .. } => "complete",
        }
    }
}

/// Ordered event consumer. Called inline from the run loop.
pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;
