//! Sandbox provider trait and types.
//!
//! A [`SandboxProvider`] creates [`RemoteSandbox`] handles. Everything above
//! this seam (operations, lifecycle, tools) is provider-agnostic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::error::SandboxError;

/// A command to execute inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Shell command, run with `sh -c`.
    pub command: String,
    /// Absolute working directory. Defaults to the sandbox home.
    pub cwd: Option<String>,
    /// Ceiling after which the command is killed.
    pub timeout: Duration,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            timeout,
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Captured output of a command that ran to completion.
///
/// A non-zero `exit_code` is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, for git commands that report on either.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Connection details for the secondary automation gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
    /// Bearer token the gateway enforces, if any.
    pub token: Option<String>,
}

/// Handle to a live sandbox.
#[async_trait]
pub trait RemoteSandbox: Send + Sync {
    /// Provider-assigned identifier.
    fn id(&self) -> &str;

    /// Absolute home directory inside the sandbox; repositories are cloned below it.
    fn home_dir(&self) -> &str;

    /// Runs a shell command, failing with [`SandboxError::Timeout`] past the ceiling.
    async fn run(&self, request: CommandRequest) -> Result<CommandOutput, SandboxError>;

    /// Reads a file by absolute path.
    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    /// Replaces a file's content, creating parent directories.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError>;

    /// Externally reachable URL for a port inside the sandbox.
    fn host_url(&self, port: u16) -> String;

    /// Tears the sandbox down.
    async fn kill(&self) -> Result<(), SandboxError>;

    /// Reads a file as UTF-8 (lossy).
    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let bytes = self.read_bytes(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Provider for creating sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Creates a new sandbox.
    async fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn RemoteSandbox>, SandboxError>;

    /// Starts the browser-automation gateway inside `sandbox`.
    ///
    /// Providers without gateway support return `Ok(None)`.
    async fn open_gateway(
        &self,
        _sandbox: &dyn RemoteSandbox,
        _config: &SandboxConfig,
    ) -> Result<Option<GatewayInfo>, SandboxError> {
        Ok(None)
    }

    /// Provider name for logs.
    fn name(&self) -> &str;
}
