//! Scripted sandbox for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::SandboxError;

use super::provider::{CommandOutput, CommandRequest, GatewayInfo, RemoteSandbox, SandboxProvider};

#[derive(Clone)]
pub(crate) enum Reply {
    Output(CommandOutput),
    Error(SandboxError),
}

pub(crate) fn ok(stdout: &str) -> Reply {
    exit(0, stdout, "")
}

pub(crate) fn exit(code: i32, stdout: &str, stderr: &str) -> Reply {
    Reply::Output(CommandOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code: code,
    })
}

struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// Sandbox whose command replies are scripted by substring match.
///
/// The first rule whose needle occurs in the command answers. Replies are
/// consumed in order; the last one repeats. Unmatched commands succeed with
/// empty output.
pub(crate) struct ScriptedSandbox {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<CommandRequest>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    fail_kill: bool,
    killed: AtomicBool,
}

impl ScriptedSandbox {
    pub(crate) fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            fail_kill: false,
            killed: AtomicBool::new(false),
        }
    }

    pub(crate) fn on(self, needle: &str, reply: Reply) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| r.needle == needle) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    needle: needle.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub(crate) fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    pub(crate) fn failing_kill(mut self) -> Self {
        self.fail_kill = true;
        self
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    pub(crate) fn requests(&self) -> Vec<CommandRequest> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn file(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub(crate) fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSandbox for ScriptedSandbox {
    fn id(&self) -> &str {
        "scripted"
    }

    fn home_dir(&self) -> &str {
        "/home/user"
    }

    async fn run(&self, request: CommandRequest) -> Result<CommandOutput, SandboxError> {
        let command = request.command.clone();
        self.commands.lock().unwrap().push(request);

        let mut rules = self.rules.lock().unwrap();
        let reply = match rules.iter_mut().find(|r| command.contains(&r.needle)) {
            Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front(),
            Some(rule) => rule.replies.front().cloned(),
            None => None,
        };

        match reply {
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::Error(e)) => Err(e),
            None => Ok(CommandOutput::default()),
        }
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::Operation(format!("failed to read {}: not found", path)))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    fn host_url(&self, port: u16) -> String {
        format!("http://sandbox.test:{}", port)
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        self.killed.store(true, Ordering::SeqCst);
        if self.fail_kill {
            Err(SandboxError::Operation("kill failed".to_string()))
        } else {
            Ok(())
        }
    }
}

enum GatewayMode {
    None,
    Available,
    Failing,
}

/// Provider handing out one shared [`ScriptedSandbox`].
pub(crate) struct ScriptedProvider {
    pub(crate) sandbox: Arc<ScriptedSandbox>,
    pub(crate) created: Arc<AtomicUsize>,
    gateway: GatewayMode,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::with_sandbox(ScriptedSandbox::new())
    }
}

impl ScriptedProvider {
    pub(crate) fn with_sandbox(sandbox: ScriptedSandbox) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
            created: Arc::new(AtomicUsize::new(0)),
            gateway: GatewayMode::None,
        }
    }

    pub(crate) fn with_gateway(mut self) -> Self {
        self.gateway = GatewayMode::Available;
        self
    }

    pub(crate) fn with_failing_gateway(mut self) -> Self {
        self.gateway = GatewayMode::Failing;
        self
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    async fn create(&self, _config: &SandboxConfig) -> Result<Arc<dyn RemoteSandbox>, SandboxError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.sandbox.clone())
    }

    async fn open_gateway(
        &self,
        sandbox: &dyn RemoteSandbox,
        _config: &SandboxConfig,
    ) -> Result<Option<GatewayInfo>, SandboxError> {
        match self.gateway {
            GatewayMode::None => Ok(None),
            GatewayMode::Available => Ok(Some(GatewayInfo {
                url: format!("{}/mcp", sandbox.host_url(8931)),
                token: Some("gateway-token".to_string()),
            })),
            GatewayMode::Failing => Err(SandboxError::Operation("gateway refused".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A session with a scripted sandbox, already initialized and cloned at `/home/user/repo`.
pub(crate) async fn cloned_session(
    sandbox: ScriptedSandbox,
) -> (Arc<super::SandboxSession>, Arc<ScriptedSandbox>) {
    let provider = ScriptedProvider::with_sandbox(sandbox);
    let handle = provider.sandbox.clone();
    let session = Arc::new(super::SandboxSession::new(
        Arc::new(provider),
        SandboxConfig::default(),
    ));
    session.initialize().await.unwrap();
    session.set_repo_path("/home/user/repo".to_string());
    (session, handle)
}
