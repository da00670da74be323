//! Tool catalogue exposed to the agent.
//!
//! Every sandbox operation is wrapped as a named tool with a JSON input
//! schema. Tools never fail across this boundary: errors become an
//! `isError` envelope the agent can read and react to.

pub mod ask;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SandboxError;
use crate::sandbox::browser::{self, BrowserAction};
use crate::sandbox::git::{self, BisectMark};
use crate::sandbox::{ops, SandboxSession};

pub use ask::{AskError, QuestionBroker};

/// Default port for preview URLs.
pub const DEFAULT_PREVIEW_PORT: u16 = 3000;

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// One block of a tool response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// Envelope returned to the agent for every tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolResponse {
    /// Success envelope. `payload` fields are merged after `"success": true`.
    pub fn success(payload: Value) -> Self {
        let mut body = serde_json::Map::new();
        body.insert("success".to_string(), Value::Bool(true));
        match payload {
            Value::Object(fields) => body.extend(fields),
            Value::Null => {}
            other => {
                body.insert("result".to_string(), other);
            }
        }
        Self {
            content: vec![ContentBlock::Text {
                text: Value::Object(body).to_string(),
            }],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text {
                text: json!({ "success": false, "error": message.into() }).to_string(),
            }],
            is_error: true,
        }
    }

    pub fn with_image(mut self, data: String, mime_type: &str) -> Self {
        self.content.push(ContentBlock::Image {
            data,
            mime_type: mime_type.to_string(),
        });
        self
    }

    /// Text blocks joined by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The payload's own `success` flag, else the inverse of `is_error`.
    pub fn succeeded(&self) -> bool {
        self.content
            .iter()
            .find_map(|b| match b {
                ContentBlock::Text { text } => serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get("success").and_then(Value::as_bool)),
                ContentBlock::Image { .. } => None,
            })
            .unwrap_or(!self.is_error)
    }
}

#[derive(Deserialize)]
struct CloneArgs {
    url: String,
    #[serde(default)]
    branch: Option<String>,
}

#[derive(Deserialize)]
struct RunCommandArgs {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct ListDirectoryArgs {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct SearchArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    glob: Option<String>,
}

#[derive(Deserialize)]
struct GitLogArgs {
    since: String,
    #[serde(default)]
    keyword: Option<String>,
}

#[derive(Deserialize)]
struct GitCheckoutArgs {
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Deserialize)]
struct BisectStartArgs {
    bad: String,
    good: String,
}

#[derive(Deserialize)]
struct BisectMarkArgs {
    mark: BisectMark,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
}

#[derive(Deserialize)]
struct BisectArgs {
    bad: String,
    good: String,
    test_command: String,
    #[serde(default)]
    max_steps: Option<u32>,
}

#[derive(Deserialize)]
struct BrowserArgs {
    actions: Vec<BrowserAction>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
struct PreviewUrlArgs {
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Deserialize)]
struct AskUserArgs {
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Deserialize)]
struct NoArgs {}

/// Named tools over one run's sandbox session.
pub struct ToolCatalogue {
    session: Arc<SandboxSession>,
    broker: Option<Arc<QuestionBroker>>,
}

impl ToolCatalogue {
    pub fn new(session: Arc<SandboxSession>, broker: Option<Arc<QuestionBroker>>) -> Self {
        Self { session, broker }
    }

    pub fn session(&self) -> &Arc<SandboxSession> {
        &self.session
    }

    fn browser_enabled(&self) -> bool {
        self.session.config().enable_browser
    }

    /// Tool definitions in a stable order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut tools = vec![
            ToolDefinition::new(
                "sandbox_clone",
                "Clone the repository into the sandbox. Call this first; other tools work relative to the clone.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "HTTPS clone URL" },
                        "branch": { "type": "string", "description": "Branch to check out (default: repository default)" }
                    },
                    "required": ["url"]
                }),
            ),
            ToolDefinition::new(
                "sandbox_run_command",
                "Run a shell command in the sandbox. A non-zero exit code is reported, not treated as a failure.",
                json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "description": "Command for sh -c" },
                        "timeout_secs": { "type": "integer", "description": "Timeout in seconds (default: 60)" },
                        "cwd": { "type": "string", "description": "Working directory (default: repository root)" }
                    },
                    "required": ["command"]
                }),
            ),
            ToolDefinition::new(
                "sandbox_read_file",
                "Read a file. Relative paths resolve against the repository root.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File path" }
                    },
                    "required": ["path"]
                }),
            ),
            ToolDefinition::new(
                "sandbox_write_file",
                "Replace a file's content, creating parent directories as needed.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File path" },
                        "content": { "type": "string", "description": "Full new content" }
                    },
                    "required": ["path", "content"]
                }),
            ),
            ToolDefinition::new(
                "sandbox_list_directory",
                "List a directory. Directories are marked with a trailing slash.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Directory (default: repository root)" }
                    }
                }),
            ),
            ToolDefinition::new(
                "sandbox_search",
                "Search file contents with a regular expression. Returns path:line:text matches.",
                json!({
                    "type": "object",
                    "properties": {
                        "pattern": { "type": "string", "description": "Regex pattern" },
                        "path": { "type": "string", "description": "File or directory (default: repository root)" },
                        "glob": { "type": "string", "description": "File glob filter, e.g. *.ts" }
                    },
                    "required": ["pattern"]
                }),
            ),
            ToolDefinition::new(
                "sandbox_git_log",
                "List commits since a date, optionally filtered by a keyword in the subject.",
                json!({
                    "type": "object",
                    "properties": {
                        "since": { "type": "string", "description": "Date accepted by git log --since, e.g. '2 weeks ago'" },
                        "keyword": { "type": "string", "description": "Case-insensitive subject filter" }
                    },
                    "required": ["since"]
                }),
            ),
            ToolDefinition::new(
                "sandbox_git_checkout",
                "Check out a branch, tag or commit.",
                json!({
                    "type": "object",
                    "properties": {
                        "ref": { "type": "string", "description": "Branch, tag or commit" }
                    },
                    "required": ["ref"]
                }),
            ),
            ToolDefinition::new(
                "sandbox_bisect_start",
                "Start a manual git bisect between a bad and a good ref.",
                json!({
                    "type": "object",
                    "properties": {
                        "bad": { "type": "string", "description": "Ref where the bug is present" },
                        "good": { "type": "string", "description": "Ref where the bug is absent" }
                    },
                    "required": ["bad", "good"]
                }),
            ),
            ToolDefinition::new(
                "sandbox_bisect_mark",
                "Mark a commit during a manual bisect.",
                json!({
                    "type": "object",
                    "properties": {
                        "mark": { "type": "string", "enum": ["good", "bad", "skip"] },
                        "ref": { "type": "string", "description": "Commit to mark (default: current)" }
                    },
                    "required": ["mark"]
                }),
            ),
            ToolDefinition::new(
                "sandbox_bisect_reset",
                "End a manual bisect and return to the original branch.",
                json!({ "type": "object", "properties": {} }),
            ),
            ToolDefinition::new(
                "sandbox_bisect",
                "Automatically bisect to find the commit that introduced a regression. The test command exits 0 for good, 125 to skip, anything else for bad.",
                json!({
                    "type": "object",
                    "properties": {
                        "bad": { "type": "string", "description": "Ref where the bug is present" },
                        "good": { "type": "string", "description": "Ref where the bug is absent" },
                        "test_command": { "type": "string", "description": "Command classifying each commit" },
                        "max_steps": { "type": "integer", "description": "Step ceiling (default: 20)" }
                    },
                    "required": ["bad", "good", "test_command"]
                }),
            ),
        ];

        if self.browser_enabled() {
            tools.push(ToolDefinition::new(
                "sandbox_browser",
                "Drive a headless browser inside the sandbox with a list of actions. Returns collected values, console output and an optional screenshot.",
                json!({
                    "type": "object",
                    "properties": {
                        "actions": {
                            "type": "array",
                            "description": "Steps executed in order",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "type": {
                                        "type": "string",
                                        "enum": [
                                            "navigate", "click", "fill", "wait_for_selector", "wait",
                                            "screenshot", "evaluate", "get_text", "get_html", "type",
                                            "press", "select", "hover", "scroll"
                                        ]
                                    },
                                    "url": { "type": "string" },
                                    "selector": { "type": "string" },
                                    "value": { "type": "string" },
                                    "text": { "type": "string" },
                                    "key": { "type": "string" },
                                    "script": { "type": "string" },
                                    "ms": { "type": "integer" },
                                    "full_page": { "type": "boolean" },
                                    "x": { "type": "integer" },
                                    "y": { "type": "integer" }
                                },
                                "required": ["type"]
                            }
                        },
                        "timeout_secs": { "type": "integer", "description": "Per-step timeout (default: 60)" }
                    },
                    "required": ["actions"]
                }),
            ));
        }

        tools.push(ToolDefinition::new(
            "sandbox_preview_url",
            "Get the externally reachable URL for a port served from the sandbox.",
            json!({
                "type": "object",
                "properties": {
                    "port": { "type": "integer", "description": "Port (default: 3000)" }
                }
            }),
        ));
        tools.push(ToolDefinition::new(
            "ask_user",
            "Ask the human operator a question and wait for the answer. Use sparingly.",
            json!({
                "type": "object",
                "properties": {
                    "question": { "type": "string" },
                    "options": { "type": "array", "items": { "type": "string" }, "description": "Suggested answers" }
                },
                "required": ["question"]
            }),
        ));
        tools
    }

    /// Invokes `name` with raw JSON `input`.
    pub async fn invoke(&self, name: &str, input: Value) -> ToolResponse {
        tracing::debug!(tool = %name, "invoking tool");
        match self.dispatch(name, input).await {
            Ok(response) => response,
            Err(message) => {
                tracing::debug!(tool = %name, error = %message, "tool failed");
                ToolResponse::error(message)
            }
        }
    }

    async fn dispatch(&self, name: &str, input: Value) -> Result<ToolResponse, String> {
        let session = self.session.as_ref();
        match name {
            "sandbox_clone" => {
                let args: CloneArgs = parse_args(name, input)?;
                if !session.is_initialized() {
                    session.initialize().await.map_err(failure)?;
                }
                let path = ops::clone_repo(session, &args.url, args.branch.as_deref())
                    .await
                    .map_err(failure)?;
                Ok(ToolResponse::success(json!({ "path": path })))
            }
            "sandbox_run_command" => {
                let args: RunCommandArgs = parse_args(name, input)?;
                let out = ops::run_command(
                    session,
                    &args.command,
                    args.timeout_secs.map(Duration::from_secs),
                    args.cwd.as_deref(),
                )
                .await
                .map_err(failure)?;
                Ok(ToolResponse::success(json!({
                    "stdout": out.stdout,
                    "stderr": out.stderr,
                    "exit_code": out.exit_code,
                })))
            }
            "sandbox_read_file" => {
                let args: PathArgs = parse_args(name, input)?;
                let content = ops::read_file(session, &args.path).await.map_err(failure)?;
                Ok(ToolResponse::success(json!({ "content": content })))
            }
            "sandbox_write_file" => {
                let args: WriteFileArgs = parse_args(name, input)?;
                let path = ops::write_file(session, &args.path, &args.content)
                    .await
                    .map_err(failure)?;
                Ok(ToolResponse::success(json!({ "path": path })))
            }
            "sandbox_list_directory" => {
                let args: ListDirectoryArgs = parse_args(name, input)?;
                let entries = ops::list_directory(session, args.path.as_deref())
                    .await
                    .map_err(failure)?;
                let names: Vec<String> = entries
                    .into_iter()
                    .map(|e| if e.is_dir { format!("{}/", e.name) } else { e.name })
                    .collect();
                Ok(ToolResponse::success(json!({ "entries": names })))
            }
            "sandbox_search" => {
                let args: SearchArgs = parse_args(name, input)?;
                let result = ops::search(
                    session,
                    &args.pattern,
                    args.path.as_deref(),
                    args.glob.as_deref(),
                )
                .await
                .map_err(failure)?;
                Ok(ToolResponse::success(json!({
                    "matches": result.matches,
                    "truncated": result.truncated,
                })))
            }
            "sandbox_git_log" => {
                let args: GitLogArgs = parse_args(name, input)?;
                let commits = git::log_since(session, &args.since, args.keyword.as_deref())
                    .await
                    .map_err(failure)?;
                Ok(ToolResponse::success(json!({ "commits": commits })))
            }
            "sandbox_git_checkout" => {
                let args: GitCheckoutArgs = parse_args(name, input)?;
                let output = git::checkout(session, &args.reference)
                    .await
                    .map_err(failure)?;
                Ok(ToolResponse::success(json!({ "output": output })))
            }
            "sandbox_bisect_start" => {
                let args: BisectStartArgs = parse_args(name, input)?;
                let output = git::bisect_start(session, &args.bad, &args.good)
                    .await
                    .map_err(failure)?;
                Ok(ToolResponse::success(json!({ "output": output })))
            }
            "sandbox_bisect_mark" => {
                let args: BisectMarkArgs = parse_args(name, input)?;
                let output = git::bisect_mark(session, args.mark, args.reference.as_deref())
                    .await
                    .map_err(failure)?;
                Ok(ToolResponse::success(json!({ "output": output })))
            }
            "sandbox_bisect_reset" => {
                let _: NoArgs = parse_args(name, input)?;
                let output = git::bisect_reset(session).await.map_err(failure)?;
                Ok(ToolResponse::success(json!({ "output": output })))
            }
            "sandbox_bisect" => {
                let args: BisectArgs = parse_args(name, input)?;
                let outcome = git::bisect_run(
                    session,
                    &args.bad,
                    &args.good,
                    &args.test_command,
                    args.max_steps,
                )
                .await
                .map_err(failure)?;
                Ok(ToolResponse::success(json!({
                    "found_commit": outcome.found_commit,
                    "steps": outcome.steps,
                    "log": outcome.log,
                    "inconclusive": outcome.inconclusive,
                })))
            }
            "sandbox_browser" => {
                if !self.browser_enabled() {
                    return Err("Browser automation is not enabled for this run".to_string());
                }
                let args: BrowserArgs = parse_args(name, input)?;
                let outcome = browser::run_browser(
                    session,
                    &args.actions,
                    args.timeout_secs.map(Duration::from_secs),
                )
                .await
                .map_err(failure)?;
                let mut response = ToolResponse {
                    content: vec![ContentBlock::Text {
                        text: json!({
                            "success": outcome.success,
                            "results": outcome.results,
                            "console": outcome.console,
                            "error": outcome.error,
                            "screenshot": outcome.screenshot.is_some(),
                        })
                        .to_string(),
                    }],
                    is_error: false,
                };
                if let Some(data) = outcome.screenshot {
                    response = response.with_image(data, "image/png");
                }
                Ok(response)
            }
            "sandbox_preview_url" => {
                let args: PreviewUrlArgs = parse_args(name, input)?;
                let port = args.port.unwrap_or(DEFAULT_PREVIEW_PORT);
                let url = session
                    .host_url(port)
                    .ok_or_else(|| SandboxError::NotInitialized.user_message())?;
                Ok(ToolResponse::success(json!({ "url": url, "port": port })))
            }
            "ask_user" => {
                let args: AskUserArgs = parse_args(name, input)?;
                let broker = self
                    .broker
                    .as_ref()
                    .ok_or_else(|| "User interaction not available".to_string())?;
                let answer = broker
                    .ask(&args.question, args.options)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(ToolResponse::success(json!({ "answer": answer })))
            }
            other => Err(format!("Unknown tool: {}", other)),
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, input: Value) -> Result<T, String> {
    let input = match input {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };
    serde_json::from_value(input).map_err(|e| format!("Invalid arguments for {}: {}", tool, e))
}

fn failure(error: SandboxError) -> String {
    error.user_message()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::{AgentEvent, EventSink};
    use crate::config::SandboxConfig;
    use crate::sandbox::testing::{cloned_session, exit, ok, ScriptedProvider, ScriptedSandbox};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn payload(response: &ToolResponse) -> Value {
        serde_json::from_str(&response.text()).unwrap()
    }

    #[tokio::test]
    async fn ask_user_without_broker_fails_immediately() {
        let (session, _sandbox) = cloned_session(ScriptedSandbox::new()).await;
        let tools = ToolCatalogue::new(session, None);

        let response = tokio::time::timeout(
            Duration::from_secs(1),
            tools.invoke("ask_user", json!({ "question": "Which version?" })),
        )
        .await
        .expect("ask_user must not wait without a broker");

        assert!(response.is_error);
        assert_eq!(payload(&response)["error"], "User interaction not available");
        assert!(!response.succeeded());
    }

    #[tokio::test]
    async fn ask_user_with_broker_returns_answer() {
        let (session, _sandbox) = cloned_session(ScriptedSandbox::new()).await;
        let broker_slot: Arc<Mutex<Option<Arc<QuestionBroker>>>> = Arc::new(Mutex::new(None));
        let slot = broker_slot.clone();
        let sink: EventSink = Arc::new(move |event| {
            if let AgentEvent::AskUser { id, .. } = event {
                let broker = slot.lock().unwrap().clone().unwrap();
                assert!(broker.answer(&id, "use v2"));
            }
        });
        let broker = Arc::new(QuestionBroker::new(sink));
        *broker_slot.lock().unwrap() = Some(broker.clone());
        let tools = ToolCatalogue::new(session, Some(broker));

        let response = tools
            .invoke("ask_user", json!({ "question": "Which API?", "options": ["v1", "v2"] }))
            .await;
        assert!(!response.is_error);
        assert_eq!(payload(&response)["answer"], "use v2");
    }

    #[tokio::test]
    async fn malformed_input_is_rejected_before_dispatch() {
        let (session, sandbox) = cloned_session(ScriptedSandbox::new()).await;
        let tools = ToolCatalogue::new(session, None);

        let response = tools.invoke("sandbox_run_command", json!({ "cmd": "ls" })).await;
        assert!(response.is_error);
        let error = payload(&response)["error"].as_str().unwrap().to_string();
        assert!(error.starts_with("Invalid arguments for sandbox_run_command:"));
        assert!(sandbox.commands().is_empty());

        let response = tools.invoke("sandbox_teleport", json!({})).await;
        assert_eq!(payload(&response)["error"], "Unknown tool: sandbox_teleport");
    }

    #[tokio::test]
    async fn clone_is_the_only_tool_that_initializes() {
        let provider = ScriptedProvider::default();
        let created = provider.created.clone();
        let session = Arc::new(SandboxSession::new(
            Arc::new(provider),
            SandboxConfig::default(),
        ));
        let tools = ToolCatalogue::new(session.clone(), None);

        let response = tools
            .invoke("sandbox_read_file", json!({ "path": "README.md" }))
            .await;
        assert!(response.is_error);
        assert!(payload(&response)["error"]
            .as_str()
            .unwrap()
            .contains("Sandbox not initialized"));
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let response = tools
            .invoke("sandbox_clone", json!({ "url": "https://github.com/octo/app.git" }))
            .await;
        assert!(!response.is_error);
        assert_eq!(payload(&response)["path"], "/home/user/app");
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(session.repo_path().as_deref(), Some("/home/user/app"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_successful_call() {
        let sandbox = ScriptedSandbox::new().on("npm test", exit(1, "", "1 failing"));
        let (session, _sandbox) = cloned_session(sandbox).await;
        let tools = ToolCatalogue::new(session, None);

        let response = tools
            .invoke("sandbox_run_command", json!({ "command": "npm test" }))
            .await;
        assert!(!response.is_error);
        let body = payload(&response);
        assert_eq!(body["success"], true);
        assert_eq!(body["exit_code"], 1);
        assert_eq!(body["stderr"], "1 failing");
    }

    #[tokio::test]
    async fn browser_tool_requires_flag_and_attaches_image() {
        let (session, _sandbox) = cloned_session(ScriptedSandbox::new()).await;
        let tools = ToolCatalogue::new(session, None);
        assert!(!tools.definitions().iter().any(|d| d.name == "sandbox_browser"));
        let response = tools
            .invoke("sandbox_browser", json!({ "actions": [{ "type": "wait", "ms": 1 }] }))
            .await;
        assert!(response.is_error);

        let sandbox = ScriptedSandbox::new()
            .on(
                "node",
                ok("__RESULT__{\"success\":true,\"screenshot\":\"/tmp/s.png\"}"),
            )
            .with_file("/tmp/s.png", "PNG");
        let provider = ScriptedProvider::with_sandbox(sandbox);
        let config = SandboxConfig {
            enable_browser: true,
            ..Default::default()
        };
        let session = Arc::new(SandboxSession::new(Arc::new(provider), config));
        session.initialize().await.unwrap();
        let tools = ToolCatalogue::new(session, None);
        assert!(tools.definitions().iter().any(|d| d.name == "sandbox_browser"));

        let response = tools
            .invoke("sandbox_browser", json!({ "actions": [{ "type": "screenshot" }] }))
            .await;
        assert!(!response.is_error);
        assert_eq!(
            response.content[1],
            ContentBlock::Image {
                data: "UE5H".to_string(),
                mime_type: "image/png".to_string()
            }
        );
    }

    #[tokio::test]
    async fn preview_url_uses_default_port() {
        let (session, _sandbox) = cloned_session(ScriptedSandbox::new()).await;
        let tools = ToolCatalogue::new(session, None);
        let response = tools.invoke("sandbox_preview_url", Value::Null).await;
        assert_eq!(payload(&response)["url"], "http://sandbox.test:3000");
    }

    #[test]
    fn envelope_wire_shape() {
        let response = ToolResponse::success(json!({ "path": "/x" })).with_image("AAAA".into(), "image/png");
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["isError"], false);
        assert_eq!(wire["content"][0]["type"], "text");
        assert_eq!(wire["content"][1]["type"], "image");
        assert_eq!(wire["content"][1]["mimeType"], "image/png");

        let error = serde_json::to_value(ToolResponse::error("boom")).unwrap();
        assert_eq!(error["isError"], true);
    }

    #[test]
    fn definitions_have_unique_names() {
        let provider = ScriptedProvider::default();
        let session = Arc::new(SandboxSession::new(Arc::new(provider), SandboxConfig::default()));
        let defs = ToolCatalogue::new(session, None).definitions();
        let mut names: Vec<_> = defs.iter().map(|d| d.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), defs.len());
        assert_eq!(defs.len(), 14);
        assert!(defs.iter().all(|d| d.input_schema["type"] == "object"));
    }
}
