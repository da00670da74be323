//! Docker container sandbox.
//!
//! Each sandbox is a detached `docker run --rm` container kept alive by
//! `sleep <timeout>`, so it disappears on its own once the hard timeout
//! passes even if teardown never runs.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::SandboxError;

use super::provider::{CommandOutput, CommandRequest, GatewayInfo, RemoteSandbox, SandboxProvider};

/// Home directory inside the container.
pub const CONTAINER_HOME: &str = "/home/user";

/// Port the Playwright MCP gateway listens on inside the container.
pub const GATEWAY_PORT: u16 = 8931;

const DOCKER_CLI_TIMEOUT: Duration = Duration::from_secs(120);

/// Provider that runs sandboxes as Docker containers.
#[derive(Debug, Clone)]
pub struct DockerSandboxProvider {
    docker: String,
}

impl Default for DockerSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerSandboxProvider {
    pub fn new() -> Self {
        Self {
            docker: "docker".to_string(),
        }
    }

    /// Uses a custom docker-compatible CLI (e.g. `podman`).
    pub fn with_cli(cli: impl Into<String>) -> Self {
        Self { docker: cli.into() }
    }

    fn published_ports(config: &SandboxConfig) -> Vec<u16> {
        let mut ports = config.forwarded_ports.clone();
        if config.enable_browser && !ports.contains(&GATEWAY_PORT) {
            ports.push(GATEWAY_PORT);
        }
        ports
    }

    /// Arguments for `docker run`.
    fn run_args(&self, name: &str, config: &SandboxConfig) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--workdir".to_string(),
            CONTAINER_HOME.to_string(),
            "-e".to_string(),
            format!("HOME={}", CONTAINER_HOME),
            "-e".to_string(),
            "GIT_TERMINAL_PROMPT=0".to_string(),
        ];
        for port in Self::published_ports(config) {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1::{}", port));
        }
        args.push(config.docker_image.clone());
        args.push("sleep".to_string());
        args.push(config.timeout_secs.to_string());
        args
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    async fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn RemoteSandbox>, SandboxError> {
        let name = format!("issue-fixer-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let args = self.run_args(&name, config);

        tracing::info!(image = %config.docker_image, name = %name, "starting sandbox container");
        let out = docker(&self.docker, &args, None, DOCKER_CLI_TIMEOUT).await?;
        if !out.success() {
            return Err(SandboxError::Operation(format!(
                "docker run failed: {}",
                out.stderr.trim()
            )));
        }
        let container_id = out.stdout.trim().to_string();

        let mut ports = HashMap::new();
        for port in Self::published_ports(config) {
            let out = docker(
                &self.docker,
                &["port".to_string(), container_id.clone(), format!("{}/tcp", port)],
                None,
                DOCKER_CLI_TIMEOUT,
            )
            .await?;
            if let Some(host) = parse_port_mapping(&out.stdout) {
                ports.insert(port, host);
            } else {
                tracing::warn!(port, "could not resolve published port");
            }
        }

        tracing::info!(container = %short_id(&container_id), ports = ?ports, "sandbox container ready");

        Ok(Arc::new(DockerSandbox {
            docker: self.docker.clone(),
            container_id,
            ports,
        }))
    }

    async fn open_gateway(
        &self,
        sandbox: &dyn RemoteSandbox,
        _config: &SandboxConfig,
    ) -> Result<Option<GatewayInfo>, SandboxError> {
        let args = vec![
            "exec".to_string(),
            "-d".to_string(),
            sandbox.id().to_string(),
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "npx -y @playwright/mcp@latest --headless --host 0.0.0.0 --port {} > /tmp/mcp-gateway.log 2>&1",
                GATEWAY_PORT
            ),
        ];
        let out = docker(&self.docker, &args, None, DOCKER_CLI_TIMEOUT).await?;
        if !out.success() {
            return Err(SandboxError::Operation(format!(
                "failed to start automation gateway: {}",
                out.stderr.trim()
            )));
        }

        // Published on host loopback; @playwright/mcp takes no auth token.
        let url = format!("{}/mcp", sandbox.host_url(GATEWAY_PORT));
        tracing::info!(url = %url, "automation gateway started");
        Ok(Some(GatewayInfo { url, token: None }))
    }

    fn name(&self) -> &str {
        "docker"
    }
}

/// A running sandbox container.
pub struct DockerSandbox {
    docker: String,
    container_id: String,
    /// Container port → `host:port`.
    ports: HashMap<u16, String>,
}

#[async_trait]
impl RemoteSandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.container_id
    }

    fn home_dir(&self) -> &str {
        CONTAINER_HOME
    }

    async fn run(&self, request: CommandRequest) -> Result<CommandOutput, SandboxError> {
        let cwd = request.cwd.clone().unwrap_or_else(|| CONTAINER_HOME.to_string());
        let args = vec![
            "exec".to_string(),
            "-w".to_string(),
            cwd,
            self.container_id.clone(),
            "sh".to_string(),
            "-c".to_string(),
            request.command.clone(),
        ];
        tracing::debug!(container = %short_id(&self.container_id), command = %request.command, "docker exec");
        let out = docker(&self.docker, &args, None, request.timeout).await?;
        if is_daemon_error(&out) {
            return Err(SandboxError::Operation(out.stderr.trim().to_string()));
        }
        Ok(out)
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let mut cmd = Command::new(&self.docker);
        cmd.args(["exec", &self.container_id, "cat", "--", path])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(DOCKER_CLI_TIMEOUT, cmd.output())
            .await
            .map_err(|_| SandboxError::Timeout {
                operation: "read file".to_string(),
                seconds: DOCKER_CLI_TIMEOUT.as_secs(),
            })?
            .map_err(|e| SandboxError::Operation(format!("failed to run docker: {}", e)))?;

        if !output.status.success() {
            return Err(SandboxError::Operation(format!(
                "failed to read {}: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        // Path travels as a positional parameter, never spliced into the script.
        let args = vec![
            "exec".to_string(),
            "-i".to_string(),
            self.container_id.clone(),
            "sh".to_string(),
            "-c".to_string(),
            "mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"".to_string(),
            "sh".to_string(),
            path.to_string(),
        ];
        let out = docker(&self.docker, &args, Some(content), DOCKER_CLI_TIMEOUT).await?;
        if !out.success() {
            return Err(SandboxError::Operation(format!(
                "failed to write {}: {}",
                path,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    fn host_url(&self, port: u16) -> String {
        match self.ports.get(&port) {
            Some(host) => format!("http://{}", host),
            None => format!("http://localhost:{}", port),
        }
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        let out = docker(
            &self.docker,
            &["rm".to_string(), "-f".to_string(), self.container_id.clone()],
            None,
            DOCKER_CLI_TIMEOUT,
        )
        .await?;
        if !out.success() && !out.stderr.contains("No such container") {
            return Err(SandboxError::Operation(format!(
                "docker rm failed: {}",
                out.stderr.trim()
            )));
        }
        tracing::info!(container = %short_id(&self.container_id), "removed sandbox container");
        Ok(())
    }
}

/// Runs the docker CLI with an optional stdin payload.
async fn docker(
    cli: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, SandboxError> {
    let mut child = Command::new(cli)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SandboxError::Operation(format!("failed to run {}: {}", cli, e)))?;

    if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(payload)
            .await
            .map_err(|e| SandboxError::Operation(format!("failed to write stdin: {}", e)))?;
        drop(pipe);
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| SandboxError::Operation(format!("{} failed: {}", cli, e)))?,
        Err(_) => {
            return Err(SandboxError::Timeout {
                operation: "command".to_string(),
                seconds: timeout.as_secs(),
            })
        }
    };

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(128 + 9),
    })
}

/// Whether a `docker exec` failure came from the daemon rather than the command.
fn is_daemon_error(out: &CommandOutput) -> bool {
    out.exit_code != 0
        && (out.stderr.starts_with("Error response from daemon")
            || out.stderr.starts_with("Error: No such container"))
}

/// Parses `docker port` output such as `127.0.0.1:49153`.
fn parse_port_mapping(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("[::]"))
        .map(|line| line.replace("0.0.0.0", "127.0.0.1"))
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_publish_forwarded_and_gateway_ports() {
        let provider = DockerSandboxProvider::new();
        let config = SandboxConfig {
            enable_browser: true,
            timeout_secs: 600,
            ..Default::default()
        };
        let args = provider.run_args("box", &config);

        assert_eq!(&args[..3], &["run", "-d", "--rm"]);
        assert!(args.contains(&"127.0.0.1::3000".to_string()));
        assert!(args.contains(&format!("127.0.0.1::{}", GATEWAY_PORT)));
        assert_eq!(args.last().map(String::as_str), Some("600"));
        assert!(args.contains(&config.docker_image));
    }

    #[test]
    fn run_args_skip_gateway_port_without_browser() {
        let provider = DockerSandboxProvider::with_cli("podman");
        let args = provider.run_args("box", &SandboxConfig::default());
        assert!(!args.contains(&format!("127.0.0.1::{}", GATEWAY_PORT)));
        assert_eq!(provider.docker, "podman");
    }

    #[test]
    fn parses_docker_port_output() {
        assert_eq!(
            parse_port_mapping("127.0.0.1:49153\n"),
            Some("127.0.0.1:49153".to_string())
        );
        assert_eq!(
            parse_port_mapping("0.0.0.0:5000\n[::]:5000\n"),
            Some("127.0.0.1:5000".to_string())
        );
        assert_eq!(parse_port_mapping(""), None);
    }

    #[test]
    fn daemon_errors_are_not_command_output() {
        let daemon = CommandOutput {
            stdout: String::new(),
            stderr: "Error response from daemon: container not running".to_string(),
            exit_code: 1,
        };
        assert!(is_daemon_error(&daemon));

        let failing_test = CommandOutput {
            stdout: String::new(),
            stderr: "1 test failed".to_string(),
            exit_code: 1,
        };
        assert!(!is_daemon_error(&failing_test));
    }

    #[tokio::test]
    #[ignore] // Requires a Docker daemon
    async fn docker_sandbox_round_trip() {
        let provider = DockerSandboxProvider::new();
        let config = SandboxConfig {
            docker_image: "alpine:3".to_string(),
            timeout_secs: 120,
            ..Default::default()
        };
        let sandbox = provider.create(&config).await.expect("create");
        sandbox
            .write_file("/home/user/x/y.txt", b"hi")
            .await
            .expect("write");
        assert_eq!(sandbox.read_file("/home/user/x/y.txt").await.unwrap(), "hi");
        let out = sandbox
            .run(CommandRequest::new("exit 4", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 4);
        sandbox.kill().await.expect("kill");
    }
}
