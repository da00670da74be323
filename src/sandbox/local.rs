//! Temp-directory sandbox on the host.
//!
//! Offers no isolation beyond a private working directory. Used for
//! development and tests; production runs use the Docker provider.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::SandboxError;

use super::provider::{CommandOutput, CommandRequest, RemoteSandbox, SandboxProvider};

/// Provider that creates [`LocalSandbox`] instances under a base directory.
#[derive(Debug, Clone, Default)]
pub struct LocalSandboxProvider {
    /// Parent of per-sandbox directories. Defaults to the system temp dir.
    base_dir: Option<PathBuf>,
}

impl LocalSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self {
            base_dir: Some(base_dir),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(&self, _config: &SandboxConfig) -> Result<Arc<dyn RemoteSandbox>, SandboxError> {
        let base = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("issue-fixer-sandboxes"),
        };
        std::fs::create_dir_all(&base)
            .map_err(|e| SandboxError::Operation(format!("failed to create sandbox base: {}", e)))?;

        let dir = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(&base)
            .map_err(|e| SandboxError::Operation(format!("failed to create sandbox dir: {}", e)))?;

        let sandbox = LocalSandbox::new(dir);
        tracing::info!(sandbox_id = %sandbox.id, home = %sandbox.home, "created local sandbox");
        Ok(Arc::new(sandbox))
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// A sandbox rooted in a private temp directory.
pub struct LocalSandbox {
    id: String,
    home: String,
    /// Dropped (and removed) on kill.
    dir: Mutex<Option<TempDir>>,
}

impl LocalSandbox {
    fn new(dir: TempDir) -> Self {
        let home = dir.path().to_string_lossy().into_owned();
        let id = dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            id,
            home,
            dir: Mutex::new(Some(dir)),
        }
    }

    fn is_alive(&self) -> bool {
        self.dir.lock().map(|d| d.is_some()).unwrap_or(false)
    }
}

#[async_trait]
impl RemoteSandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn home_dir(&self) -> &str {
        &self.home
    }

    async fn run(&self, request: CommandRequest) -> Result<CommandOutput, SandboxError> {
        if !self.is_alive() {
            return Err(SandboxError::NotInitialized);
        }
        let cwd = request.cwd.clone().unwrap_or_else(|| self.home.clone());
        if !Path::new(&cwd).is_dir() {
            return Err(SandboxError::Operation(format!(
                "working directory does not exist: {}",
                cwd
            )));
        }

        tracing::debug!(sandbox_id = %self.id, cwd = %cwd, command = %request.command, "running command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&request.command)
            .current_dir(&cwd)
            .env("HOME", &self.home)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Operation(format!("failed to spawn shell: {}", e)))?;

        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| SandboxError::Operation(format!("command failed: {}", e)))?
            }
            Err(_) => {
                return Err(SandboxError::Timeout {
                    operation: "command".to_string(),
                    seconds: request.timeout.as_secs(),
                })
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Killed by signal: report like a shell would.
            exit_code: output.status.code().unwrap_or(128 + 9),
        })
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        if !self.is_alive() {
            return Err(SandboxError::NotInitialized);
        }
        tokio::fs::read(path)
            .await
            .map_err(|e| SandboxError::Operation(format!("failed to read {}: {}", path, e)))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        if !self.is_alive() {
            return Err(SandboxError::NotInitialized);
        }
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SandboxError::Operation(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| SandboxError::Operation(format!("failed to write {}: {}", path, e)))
    }

    fn host_url(&self, port: u16) -> String {
        format!("http://localhost:{}", port)
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        let dir = self
            .dir
            .lock()
            .map_err(|_| SandboxError::Operation("sandbox state poisoned".to_string()))?
            .take();
        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();
            dir.close().map_err(|e| {
                SandboxError::Operation(format!("failed to remove {}: {}", path.display(), e))
            })?;
            tracing::info!(sandbox_id = %self.id, "removed local sandbox");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn create() -> (TempDir, Arc<dyn RemoteSandbox>) {
        let base = TempDir::new().unwrap();
        let provider = LocalSandboxProvider::with_base_dir(base.path().to_path_buf());
        let sandbox = provider.create(&SandboxConfig::default()).await.unwrap();
        (base, sandbox)
    }

    #[tokio::test]
    async fn runs_commands_in_home() {
        let (_base, sandbox) = create().await;
        let out = sandbox
            .run(CommandRequest::new("pwd; echo err >&2; exit 3", Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "err");
        let pwd = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(pwd, std::fs::canonicalize(sandbox.home_dir()).unwrap());
    }

    #[tokio::test]
    async fn command_timeout_is_distinguished() {
        let (_base, sandbox) = create().await;
        let err = sandbox
            .run(CommandRequest::new("sleep 5", Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));
    }

    #[tokio::test]
    async fn writes_and_reads_nested_files() {
        let (_base, sandbox) = create().await;
        let path = format!("{}/a/b/c.txt", sandbox.home_dir());
        sandbox.write_file(&path, b"hello").await.unwrap();
        assert_eq!(sandbox.read_file(&path).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn kill_removes_directory_and_is_repeatable() {
        let (_base, sandbox) = create().await;
        let home = sandbox.home_dir().to_string();
        assert!(Path::new(&home).exists());

        sandbox.kill().await.unwrap();
        sandbox.kill().await.unwrap();
        assert!(!Path::new(&home).exists());

        let err = sandbox
            .run(CommandRequest::new("true", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err, SandboxError::NotInitialized);
    }
}
