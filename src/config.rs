//! Settings loading and validation.
//!
//! Settings come from an optional TOML file, overlaid by environment
//! variables, then by CLI flags in `main.rs`. They are validated once at
//! startup and passed down explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "issue-fixer.toml";

/// Models known to the cost table; others are accepted with a warning.
pub const KNOWN_MODELS: &[&str] = &[
    "claude-sonnet-4-5",
    "claude-sonnet-4-20250514",
    "claude-opus-4-1",
    "claude-opus-4-20250514",
    "claude-haiku-4-5",
    "claude-3-7-sonnet-latest",
];

/// Smallest thinking budget the Messages API accepts.
pub const MIN_THINKING_BUDGET: u32 = 1024;

/// Agent run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model identifier.
    pub model: String,
    /// Optional turn ceiling.
    pub max_turns: Option<u32>,
    /// Extended-thinking token budget.
    pub thinking_budget: u32,
    /// Surface partial (streaming) thinking/message events.
    pub interactive: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            max_turns: Some(50),
            thinking_budget: 10_000,
            interactive: false,
        }
    }
}

/// Which sandbox backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxProviderKind {
    /// Temp-directory sandbox on the host. Development and tests.
    Local,
    /// Disposable Docker container.
    #[default]
    Docker,
}

impl std::str::FromStr for SandboxProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "docker" => Ok(Self::Docker),
            other => Err(ConfigError::Invalid {
                key: "sandbox.provider".to_string(),
                reason: format!("unknown provider '{}' (expected local or docker)", other),
            }),
        }
    }
}

/// Sandbox configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub provider: SandboxProviderKind,
    /// Hard lifetime of the sandbox, in seconds.
    pub timeout_secs: u64,
    /// Default ceiling for one sandbox command, in seconds.
    pub command_timeout_secs: u64,
    /// Token injected into clone URLs. Never serialized.
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    /// Enable browser automation (Playwright script tool and MCP gateway).
    pub enable_browser: bool,
    /// Image for the Docker provider.
    pub docker_image: String,
    /// Ports published from the sandbox for preview URLs.
    pub forwarded_ports: Vec<u16>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: SandboxProviderKind::default(),
            timeout_secs: 3600,
            command_timeout_secs: 60,
            github_token: None,
            enable_browser: false,
            docker_image: "mcr.microsoft.com/playwright:v1.47.0-jammy".to_string(),
            forwarded_ports: vec![3000],
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Anthropic API key. Never serialized.
    #[serde(skip_serializing)]
    pub anthropic_api_key: Option<String>,
    /// Override for the Messages API root.
    pub anthropic_base_url: Option<String>,
    /// GitHub token for the REST lookup and for cloning.
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    pub agent: AgentConfig,
    pub sandbox: SandboxConfig,
}

impl Settings {
    /// Loads settings from `path` (or `issue-fixer.toml` if present) and the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match resolve_config_path(path) {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Parses a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parses TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Overlays environment variables resolved through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = Some(key);
        }
        if let Some(url) = non_empty("ANTHROPIC_BASE_URL") {
            self.anthropic_base_url = Some(url);
        }
        if let Some(token) = non_empty("GITHUB_TOKEN") {
            self.github_token = Some(token);
        }
        if let Some(model) = non_empty("ISSUE_FIXER_MODEL") {
            self.agent.model = model;
        }
        if let Some(provider) = non_empty("ISSUE_FIXER_SANDBOX") {
            match provider.parse() {
                Ok(kind) => self.sandbox.provider = kind,
                Err(e) => tracing::warn!(error = %e, "ignoring ISSUE_FIXER_SANDBOX"),
            }
        }

        if self.sandbox.github_token.is_none() {
            self.sandbox.github_token = self.github_token.clone();
        }
    }

    /// Returns the API key or a `Missing` error.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.anthropic_api_key
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("ANTHROPIC_API_KEY".to_string()))
    }
}

fn resolve_config_path(path: Option<&Path>) -> Option<PathBuf> {
    match path {
        Some(p) => Some(p.to_path_buf()),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        }
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Fatal problems.
    pub errors: Vec<String>,
    /// Non-fatal problems, logged at startup.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors. Returns the warnings.
    pub fn into_result(self) -> Result<Vec<String>, ConfigError> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(ConfigError::Invalid {
                key: "settings".to_string(),
                reason: self.errors.join("; "),
            })
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

impl Validate for AgentConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.model.trim().is_empty() {
            result.add_error("agent.model cannot be empty");
        } else if !KNOWN_MODELS.contains(&self.model.as_str()) {
            result.add_warning(format!(
                "unknown model '{}', cost will be estimated with default pricing",
                self.model
            ));
        }

        match self.max_turns {
            Some(0) => result.add_error("agent.max_turns must be at least 1"),
            Some(n) if n > 200 => {
                result.add_warning("agent.max_turns over 200 may lead to excessive LLM spend")
            }
            _ => {}
        }

        if self.thinking_budget < MIN_THINKING_BUDGET {
            result.add_error(format!(
                "agent.thinking_budget must be at least {}",
                MIN_THINKING_BUDGET
            ));
        }

        result
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.timeout_secs == 0 {
            result.add_error("sandbox.timeout_secs must be greater than zero");
        } else if self.timeout_secs < 300 {
            result.add_warning("sandbox.timeout_secs under 5 minutes may cut runs short");
        }

        if self.command_timeout_secs == 0 {
            result.add_error("sandbox.command_timeout_secs must be greater than zero");
        } else if self.command_timeout_secs > self.timeout_secs {
            result.add_warning("sandbox.command_timeout_secs exceeds the sandbox lifetime");
        }

        if self.provider == SandboxProviderKind::Docker && self.docker_image.trim().is_empty() {
            result.add_error("sandbox.docker_image is required for the docker provider");
        }

        if self.enable_browser && self.provider == SandboxProviderKind::Local {
            result.add_warning(
                "browser automation on the local provider needs Node and Playwright on the host; no gateway is available",
            );
        }

        if self.forwarded_ports.contains(&0) {
            result.add_error("sandbox.forwarded_ports cannot contain port 0");
        }

        result
    }
}

impl Validate for Settings {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.anthropic_api_key.is_none() {
            result.add_error("ANTHROPIC_API_KEY is not set");
        }
        if self.github_token.is_none() {
            result.add_warning(
                "GITHUB_TOKEN is not set; private repositories and higher rate limits are unavailable",
            );
        }

        result.merge(self.agent.validate());
        result.merge(self.sandbox.validate());
        result
    }
}
