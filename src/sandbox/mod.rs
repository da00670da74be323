//! Remote sandbox abstraction.
//!
//! The [`SandboxProvider`] trait creates [`RemoteSandbox`] handles; the
//! [`SandboxSession`] owns one run's handle; [`ops`], [`git`] and
//! [`browser`] are stateless operations over a session.

pub mod browser;
mod docker;
pub mod git;
mod local;
pub mod ops;
mod provider;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use docker::{DockerSandboxProvider, CONTAINER_HOME, GATEWAY_PORT};
pub use local::{LocalSandbox, LocalSandboxProvider};
pub use provider::{CommandOutput, CommandRequest, GatewayInfo, RemoteSandbox, SandboxProvider};
pub use session::{SandboxSession, SessionSnapshot};

use std::sync::Arc;

use crate::config::{SandboxConfig, SandboxProviderKind};

/// Builds the provider selected by `config.provider`.
pub fn provider_for(config: &SandboxConfig) -> Arc<dyn SandboxProvider> {
    match config.provider {
        SandboxProviderKind::Local => Arc::new(LocalSandboxProvider::new()),
        SandboxProviderKind::Docker => Arc::new(DockerSandboxProvider::new()),
    }
}
