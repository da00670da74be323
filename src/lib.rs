//! issue-fixer: autonomous agent that turns a GitHub issue into a verified
//! fix inside a disposable sandbox.
//!
//! A run fetches the issue, provisions a sandbox, streams an LLM session
//! whose only I/O surface is the sandboxed tool catalogue, and reconciles
//! the agent's final text into a typed [`AgentReport`]. The sandbox is
//! released on every exit path.

pub mod agent;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod github;
pub mod prompt;
pub mod runtime;
pub mod sandbox;
pub mod tools;

pub use agent::{AgentEvent, AgentReport, AgentRun, EventSink, Phase, ReportStatus};
pub use config::{Settings, Validate, ValidationResult};
pub use error::{Error, Result};
pub use github::{GitHubClient, Issue, IssueRef, Repository};
pub use runtime::{AgentRuntime, AgentSession, AnthropicRuntime};
pub use sandbox::{SandboxProvider, SandboxSession};
pub use tools::{QuestionBroker, ToolCatalogue};
