//! Sandbox lifecycle management.
//!
//! [`SandboxSession`] is the single owner of the remote handle, the cloned
//! repository path and the gateway details for one run. Operations borrow the
//! handle for the duration of one call.

use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::error::SandboxError;

use super::provider::{GatewayInfo, RemoteSandbox, SandboxProvider};

/// Point-in-time view of the session. All fields are `None` when torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionSnapshot {
    pub sandbox_id: Option<String>,
    pub repo_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub gateway: Option<GatewayInfo>,
}

#[derive(Default)]
struct SessionState {
    handle: Option<Arc<dyn RemoteSandbox>>,
    repo_path: Option<String>,
    started_at: Option<DateTime<Utc>>,
    gateway: Option<GatewayInfo>,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            sandbox_id: self.handle.as_ref().map(|h| h.id().to_string()),
            repo_path: self.repo_path.clone(),
            started_at: self.started_at,
            gateway: self.gateway.clone(),
        }
    }
}

/// Owner of one run's sandbox.
pub struct SandboxSession {
    provider: Arc<dyn SandboxProvider>,
    config: SandboxConfig,
    state: RwLock<SessionState>,
    /// Serializes initialize/cleanup so two callers cannot create two sandboxes.
    lifecycle: tokio::sync::Mutex<()>,
}

impl SandboxSession {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SandboxConfig) -> Self {
        Self {
            provider,
            config,
            state: RwLock::new(SessionState::default()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Creates the sandbox (and gateway, if enabled). Returns the current
    /// snapshot unchanged when already initialized.
    pub async fn initialize(&self) -> Result<SessionSnapshot, SandboxError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_initialized() {
            return Ok(self.snapshot());
        }

        let handle = self.provider.create(&self.config).await?;

        let gateway = if self.config.enable_browser {
            match self.provider.open_gateway(handle.as_ref(), &self.config).await {
                Ok(gateway) => gateway,
                Err(e) => {
                    tracing::warn!(error = %e, "automation gateway unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let mut state = self.write_state();
        state.handle = Some(handle);
        state.repo_path = None;
        state.started_at = Some(Utc::now());
        state.gateway = gateway;

        tracing::info!(
            provider = %self.provider.name(),
            sandbox_id = ?state.handle.as_ref().map(|h| h.id().to_string()),
            gateway = state.gateway.is_some(),
            "sandbox initialized"
        );
        Ok(state.snapshot())
    }

    /// Tears the sandbox down and resets every field.
    ///
    /// Idempotent. Teardown errors are logged and discarded.
    pub async fn cleanup(&self) {
        let _guard = self.lifecycle.lock().await;
        let handle = {
            let mut state = self.write_state();
            let handle = state.handle.take();
            *state = SessionState::default();
            handle
        };

        if let Some(handle) = handle {
            let id = handle.id().to_string();
            match handle.kill().await {
                Ok(()) => tracing::info!(sandbox_id = %id, "sandbox cleaned up"),
                Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "sandbox teardown failed"),
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.read_state().handle.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.read_state().snapshot()
    }

    /// The remote handle, or `NotInitialized`.
    pub fn handle(&self) -> Result<Arc<dyn RemoteSandbox>, SandboxError> {
        self.read_state()
            .handle
            .clone()
            .ok_or(SandboxError::NotInitialized)
    }

    pub fn repo_path(&self) -> Option<String> {
        self.read_state().repo_path.clone()
    }

    pub fn gateway(&self) -> Option<GatewayInfo> {
        self.read_state().gateway.clone()
    }

    /// Records the cloned repository. Only the clone operation calls this.
    pub(crate) fn set_repo_path(&self, path: String) {
        self.write_state().repo_path = Some(path);
    }

    /// Externally reachable URL for a sandbox port; `None` when uninitialized.
    pub fn host_url(&self, port: u16) -> Option<String> {
        self.read_state().handle.as_ref().map(|h| h.host_url(port))
    }

    /// Resolves a possibly relative path against the repository root.
    pub fn resolve_path(&self, path: &str) -> Result<String, SandboxError> {
        let state = self.read_state();
        if state.handle.is_none() {
            return Err(SandboxError::NotInitialized);
        }
        if Path::new(path).is_absolute() {
            return Ok(path.to_string());
        }
        let root = state.repo_path.as_deref().ok_or(SandboxError::NotInitialized)?;
        let relative = path.trim_start_matches("./");
        if relative.is_empty() || relative == "." {
            Ok(root.to_string())
        } else {
            Ok(format!("{}/{}", root.trim_end_matches('/'), relative))
        }
    }

    /// Default working directory: the repository, else the sandbox home.
    pub fn working_dir(&self) -> Result<String, SandboxError> {
        let state = self.read_state();
        let handle = state.handle.as_ref().ok_or(SandboxError::NotInitialized)?;
        Ok(state
            .repo_path
            .clone()
            .unwrap_or_else(|| handle.home_dir().to_string()))
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        let handle = self.write_state().handle.take();
        if let Some(handle) = handle {
            tracing::warn!(sandbox_id = %handle.id(), "session dropped without cleanup, tearing down");
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = handle.kill().await {
                        tracing::error!(error = %e, "failed to tear down sandbox on drop");
                    }
                });
            }
        }
    }
}
