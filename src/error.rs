//! Error types for issue-fixer.
//!
//! Every error renders two ways: `Display` is the diagnostic message for logs,
//! `user_message()` is what presentation layers and tool envelopes show.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Configuration errors. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing required setting: {0}")]
    Missing(String),

    /// A setting is present but unusable.
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },

    /// The config file could not be read or parsed.
    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Errors from the GitHub REST lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GitHubError {
    /// Token missing, expired or lacking scope.
    #[error("GitHub authentication failed")]
    Auth,

    /// Rate limit exhausted.
    #[error("GitHub rate limit exceeded, resets at {reset_at:?}")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// Issue or repository does not exist (or is private).
    #[error("GitHub resource not found: {0}")]
    NotFound(String),

    /// Any other non-success response.
    #[error("GitHub API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure.
    #[error("GitHub request failed: {0}")]
    Http(String),
}

/// Errors from sandbox operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// Generic operation failure, carrying captured stderr where available.
    #[error("sandbox operation failed: {0}")]
    Operation(String),

    /// Operation exceeded its ceiling.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Command ran but exited non-zero, for callers that treat that as failure.
    #[error("command `{command}` exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// No sandbox handle, or no repository cloned yet.
    #[error("sandbox not initialized")]
    NotInitialized,
}

/// Errors from the agent runtime boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The turn ceiling was reached before the agent finished.
    #[error("agent reached the maximum of {0} turns")]
    MaxTurns(u32),

    /// Upstream LLM API failure keyed by HTTP status.
    #[error("LLM API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The message stream broke mid-run.
    #[error("agent stream failed: {0}")]
    Stream(String),
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    /// The issue URL is not of the form `github.com/{owner}/{repo}/issues/{n}`.
    #[error("invalid issue URL: {0}")]
    InvalidIssueUrl(String),

    /// The run was cancelled externally.
    #[error("run cancelled")]
    Cancelled,

    /// IO error outside the sandbox (config files, terminal).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            ConfigError::Missing(key) => format!("Missing required setting '{}'.", key),
            ConfigError::Invalid { key, reason } => {
                format!("Setting '{}' is invalid: {}.", key, reason)
            }
            ConfigError::Parse(_) => "The configuration file could not be parsed.".to_string(),
        }
    }
}

impl GitHubError {
    pub fn user_message(&self) -> String {
        match self {
            GitHubError::Auth => {
                "GitHub rejected the credentials. Check that GITHUB_TOKEN is set and valid."
                    .to_string()
            }
            GitHubError::RateLimited { reset_at: Some(at) } => format!(
                "GitHub rate limit reached. Try again after {}.",
                at.format("%H:%M:%S UTC")
            ),
            GitHubError::RateLimited { reset_at: None } => {
                "GitHub rate limit reached. Try again later.".to_string()
            }
            GitHubError::NotFound(what) => format!(
                "Could not find {} on GitHub. It may be private or mistyped.",
                what
            ),
            GitHubError::Api { status, .. } => {
                format!("GitHub returned an unexpected error (HTTP {}).", status)
            }
            GitHubError::Http(_) => "Could not reach GitHub.".to_string(),
        }
    }
}

impl SandboxError {
    pub fn user_message(&self) -> String {
        match self {
            SandboxError::Operation(detail) => detail.clone(),
            SandboxError::Timeout { operation, seconds } => {
                format!("{} timed out after {} seconds", operation, seconds)
            }
            SandboxError::NonZeroExit {
                command,
                exit_code,
                stderr,
            } => {
                if stderr.trim().is_empty() {
                    format!("`{}` failed with exit code {}", command, exit_code)
                } else {
                    format!(
                        "`{}` failed with exit code {}: {}",
                        command,
                        exit_code,
                        stderr.trim()
                    )
                }
            }
            SandboxError::NotInitialized => {
                "Sandbox not initialized. Clone the repository with sandbox_clone first."
                    .to_string()
            }
        }
    }
}

impl AgentError {
    pub fn user_message(&self) -> String {
        match self {
            AgentError::MaxTurns(n) => format!("The agent ran out of turns ({}).", n),
            AgentError::Api { status: 401, .. } => {
                "The LLM API rejected the API key. Check ANTHROPIC_API_KEY.".to_string()
            }
            AgentError::Api { status: 429, .. } => {
                "The LLM API is rate limiting requests. Try again shortly.".to_string()
            }
            AgentError::Api { status, .. } if *status >= 500 => {
                "The LLM API is temporarily unavailable.".to_string()
            }
            AgentError::Api { status, message } => {
                format!("The LLM API returned an error ({}): {}", status, message)
            }
            AgentError::Stream(_) => "The connection to the agent was interrupted.".to_string(),
        }
    }
}

impl Error {
    /// Human-readable message, safe to show to end users.
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(e) => e.user_message(),
            Error::GitHub(e) => e.user_message(),
            Error::Sandbox(e) => e.user_message(),
            Error::Agent(e) => e.user_message(),
            Error::InvalidIssueUrl(url) => format!(
                "'{}' is not a GitHub issue URL. Expected https://github.com/<owner>/<repo>/issues/<number>.",
                url
            ),
            Error::Cancelled => "The run was cancelled.".to_string(),
            Error::Io(e) => format!("I/O error: {}", e),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
