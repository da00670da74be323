//! Agent run protocol against a scripted runtime and a local sandbox.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use issue_fixer::agent::{AgentEvent, AgentRun, EventSink, Phase, ReportStatus};
use issue_fixer::config::{AgentConfig, SandboxConfig, SandboxProviderKind};
use issue_fixer::error::{AgentError, Error};
use issue_fixer::github::{Issue, Repository};
use issue_fixer::runtime::{
    AgentMessage, AgentRuntime, AgentSession, AssistantBlock, ResultSubtype, RunOutcome,
    SessionRequest, ToolResultBlock,
};
use issue_fixer::sandbox::LocalSandboxProvider;
use issue_fixer::tools::{QuestionBroker, ToolCatalogue, ToolResponse};

enum Step {
    Send(AgentMessage),
    /// Invokes a tool through the catalogue, like a real runtime would.
    Call {
        id: &'static str,
        name: &'static str,
        input: Value,
    },
    Fail(AgentError),
}

struct ScriptedRuntime {
    steps: Mutex<Option<Vec<Step>>>,
    responses: Arc<Mutex<Vec<ToolResponse>>>,
    requests: Arc<Mutex<Vec<SessionRequest>>>,
}

impl ScriptedRuntime {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(Some(steps)),
            responses: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn open(
        &self,
        request: SessionRequest,
        tools: Arc<ToolCatalogue>,
    ) -> Result<Box<dyn AgentSession>, AgentError> {
        self.requests.lock().unwrap().push(request);
        let steps = self.steps.lock().unwrap().take().unwrap_or_default();
        Ok(Box::new(ScriptedSession {
            steps: steps.into(),
            tools,
            responses: self.responses.clone(),
        }))
    }
}

struct ScriptedSession {
    steps: VecDeque<Step>,
    tools: Arc<ToolCatalogue>,
    responses: Arc<Mutex<Vec<ToolResponse>>>,
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn next_message(&mut self) -> Option<Result<AgentMessage, AgentError>> {
        match self.steps.pop_front()? {
            Step::Send(message) => Some(Ok(message)),
            Step::Fail(error) => Some(Err(error)),
            Step::Call { id, name, input } => {
                let response = self.tools.invoke(name, input).await;
                self.responses.lock().unwrap().push(response.clone());
                Some(Ok(AgentMessage::ToolResults(vec![ToolResultBlock {
                    tool_use_id: id.to_string(),
                    name: name.to_string(),
                    response,
                }])))
            }
        }
    }
}

fn tool_use(id: &str, name: &str, input: Value) -> AssistantBlock {
    AssistantBlock::ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        input,
    }
}

fn finish(text: &str) -> Step {
    Step::Send(AgentMessage::Result(RunOutcome {
        subtype: ResultSubtype::Success,
        is_error: false,
        text: text.to_string(),
        turns: 2,
        cost_usd: 0.42,
    }))
}

fn issue() -> Issue {
    Issue {
        number: 12,
        title: "Panic on empty config".to_string(),
        body: None,
        state: "open".to_string(),
        labels: vec!["bug".to_string()],
        comments: Vec::new(),
        url: "https://github.com/octo/app/issues/12".to_string(),
    }
}

fn repository() -> Repository {
    Repository {
        owner: "octo".to_string(),
        name: "app".to_string(),
        default_branch: "main".to_string(),
        clone_url: "https://github.com/octo/app.git".to_string(),
        private: false,
    }
}

fn sandbox_config() -> SandboxConfig {
    SandboxConfig {
        provider: SandboxProviderKind::Local,
        ..SandboxConfig::default()
    }
}

fn new_run(runtime: Arc<ScriptedRuntime>, base: &TempDir) -> AgentRun {
    AgentRun::new(
        runtime,
        Arc::new(LocalSandboxProvider::with_base_dir(base.path().to_path_buf())),
        AgentConfig::default(),
        sandbox_config(),
    )
}

fn recorder() -> (EventSink, Arc<Mutex<Vec<AgentEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: EventSink = Arc::new(move |event| sink_events.lock().unwrap().push(event));
    (sink, events)
}

fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    let mut kinds: Vec<&'static str> = events.iter().map(AgentEvent::kind).collect();
    kinds.dedup();
    kinds
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

const FINAL_TEXT: &str = "[phase: validating]\nThe guard fixes it.\n```json\n{\"status\": \"solved\", \"summary\": \"Guarded the empty config {path}\", \"reproduced\": true, \"filesChanged\": [\"src/config.rs\"]}\n```";

#[tokio::test]
async fn events_follow_causal_order() {
    let base = TempDir::new().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        Step::Send(AgentMessage::System {
            session_id: "sess_1".to_string(),
            model: "claude-sonnet-4-5".to_string(),
        }),
        Step::Send(AgentMessage::Assistant(vec![
            AssistantBlock::Thinking("Try the command first.".to_string()),
            tool_use("toolu_1", "sandbox_run_command", json!({ "command": "echo hi" })),
        ])),
        Step::Call {
            id: "toolu_1",
            name: "sandbox_run_command",
            input: json!({ "command": "echo hi" }),
        },
        Step::Send(AgentMessage::Assistant(vec![AssistantBlock::Text(
            FINAL_TEXT.to_string(),
        )])),
        finish(FINAL_TEXT),
    ]));
    let (sink, events) = recorder();

    let report = new_run(runtime.clone(), &base)
        .with_sink(sink)
        .execute(&issue(), &repository(), CancellationToken::new())
        .await
        .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        kinds(&events),
        vec![
            "phase_change",
            "turn_complete",
            "thinking",
            "tool_call",
            "tool_result",
            "turn_complete",
            "phase_change",
            "message",
            "complete",
        ]
    );

    let phases: Vec<Phase> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::PhaseChange { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![Phase::Initializing, Phase::Exploring, Phase::Validating]
    );

    let call_id = events.iter().find_map(|e| match e {
        AgentEvent::ToolCall { id, .. } => Some(id.clone()),
        _ => None,
    });
    let result = events.iter().find_map(|e| match e {
        AgentEvent::ToolResult {
            id,
            success,
            output,
            ..
        } => Some((id.clone(), *success, output.clone())),
        _ => None,
    });
    let (result_id, success, output) = result.unwrap();
    assert_eq!(call_id.as_deref(), Some("toolu_1"));
    assert_eq!(result_id, "toolu_1");
    assert!(success);
    assert!(output.contains("hi"));

    assert!(matches!(
        &report.status,
        ReportStatus::Solved { summary, fix_description }
            if summary == "Guarded the empty config {path}" && fix_description == "Fix applied"
    ));
    assert!(report.reproduced);
    assert_eq!(report.files_changed, vec!["src/config.rs".to_string()]);
    assert_eq!(report.turns, 2);
    assert!((report.cost_usd - 0.42).abs() < 1e-9);
    assert!(report.preview_url.is_some());

    let requests = runtime.requests.lock().unwrap();
    assert!(requests[0].prompt.contains("Fix issue #12 in octo/app."));
    assert!(requests[0].mcp_servers.is_empty());

    assert!(is_empty_dir(base.path()));
}

#[tokio::test]
async fn stream_error_after_tool_call_cleans_up() {
    let base = TempDir::new().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        Step::Send(AgentMessage::Assistant(vec![tool_use(
            "toolu_1",
            "sandbox_run_command",
            json!({ "command": "touch marker" }),
        )])),
        Step::Call {
            id: "toolu_1",
            name: "sandbox_run_command",
            input: json!({ "command": "touch marker" }),
        },
        Step::Fail(AgentError::Stream("connection reset".to_string())),
    ]));
    let (sink, events) = recorder();

    let result = new_run(runtime, &base)
        .with_sink(sink)
        .execute(&issue(), &repository(), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Agent(AgentError::Stream(_)))));

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| e.kind() == "tool_result"));
    assert!(!events.iter().any(|e| e.kind() == "complete"));
    match events.last() {
        Some(AgentEvent::Error { message }) => {
            assert_eq!(message, "The connection to the agent was interrupted.")
        }
        other => panic!("expected a trailing error event, got {:?}", other),
    }
    assert_eq!(events.iter().filter(|e| e.kind() == "error").count(), 1);

    assert!(is_empty_dir(base.path()));
}

#[tokio::test]
async fn cancellation_rejects_pending_question() {
    let base = TempDir::new().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        Step::Send(AgentMessage::Assistant(vec![tool_use(
            "toolu_1",
            "ask_user",
            json!({ "question": "Which branch reproduces it?" }),
        )])),
        Step::Call {
            id: "toolu_1",
            name: "ask_user",
            input: json!({ "question": "Which branch reproduces it?" }),
        },
        finish("unreachable"),
    ]));

    let cancel = CancellationToken::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let on_question = cancel.clone();
    let sink: EventSink = Arc::new(move |event: AgentEvent| {
        if event.kind() == "ask_user" {
            on_question.cancel();
        }
        sink_events.lock().unwrap().push(event);
    });

    let run = new_run(runtime.clone(), &base).with_sink(sink);
    let broker = run.questions().unwrap();
    let result = run.execute(&issue(), &repository(), cancel).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(broker.pending_count(), 0);
    assert!(runtime.responses.lock().unwrap().is_empty());

    let events = events.lock().unwrap();
    let kinds = kinds(&events);
    assert!(kinds.contains(&"ask_user"));
    assert_eq!(kinds.last(), Some(&"error"));
    assert!(!kinds.contains(&"complete"));

    assert!(is_empty_dir(base.path()));
}

#[tokio::test]
async fn answered_question_flows_back_to_the_agent() {
    let base = TempDir::new().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        Step::Send(AgentMessage::Assistant(vec![tool_use(
            "toolu_1",
            "ask_user",
            json!({ "question": "Staging or prod?", "options": ["staging", "prod"] }),
        )])),
        Step::Call {
            id: "toolu_1",
            name: "ask_user",
            input: json!({ "question": "Staging or prod?", "options": ["staging", "prod"] }),
        },
        finish("```json\n{\"status\": \"partial\", \"summary\": \"Half done\"}\n```"),
    ]));

    let broker_slot: Arc<OnceLock<Arc<QuestionBroker>>> = Arc::new(OnceLock::new());
    let slot = broker_slot.clone();
    let sink: EventSink = Arc::new(move |event: AgentEvent| {
        if let AgentEvent::AskUser { id, options, .. } = &event {
            assert_eq!(options, &vec!["staging".to_string(), "prod".to_string()]);
            assert!(slot.get().unwrap().answer(id, "staging"));
        }
    });

    let run = new_run(runtime.clone(), &base).with_sink(sink);
    let _ = broker_slot.set(run.questions().unwrap());
    let report = run
        .execute(&issue(), &repository(), CancellationToken::new())
        .await
        .unwrap();

    let responses = runtime.responses.lock().unwrap();
    assert!(!responses[0].is_error);
    assert!(responses[0].text().contains("staging"));
    assert!(matches!(
        &report.status,
        ReportStatus::Partial { remaining_work, .. } if remaining_work == "Additional work needed"
    ));
}

#[tokio::test]
async fn run_without_sink_cannot_ask() {
    let base = TempDir::new().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        Step::Call {
            id: "toolu_1",
            name: "ask_user",
            input: json!({ "question": "Anyone there?" }),
        },
        finish("I could not finish."),
    ]));

    let run = new_run(runtime.clone(), &base);
    assert!(run.questions().is_none());
    let report = run
        .execute(&issue(), &repository(), CancellationToken::new())
        .await
        .unwrap();

    let responses = runtime.responses.lock().unwrap();
    assert!(responses[0].is_error);
    assert!(responses[0].text().contains("User interaction not available"));
    assert!(matches!(report.status, ReportStatus::NeedsHuman { .. }));
    assert!(is_empty_dir(base.path()));
}

#[tokio::test]
async fn rejected_question_lets_the_run_finish() {
    let base = TempDir::new().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        Step::Send(AgentMessage::Assistant(vec![tool_use(
            "toolu_1",
            "ask_user",
            json!({ "question": "Which environment?" }),
        )])),
        Step::Call {
            id: "toolu_1",
            name: "ask_user",
            input: json!({ "question": "Which environment?" }),
        },
        finish("```json\n{\"status\": \"needs_human\", \"summary\": \"No answer\"}\n```"),
    ]));

    let broker_slot: Arc<OnceLock<Arc<QuestionBroker>>> = Arc::new(OnceLock::new());
    let slot = broker_slot.clone();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: EventSink = Arc::new(move |event: AgentEvent| {
        if let AgentEvent::AskUser { id, .. } = &event {
            assert!(slot.get().unwrap().reject(id));
        }
        sink_events.lock().unwrap().push(event);
    });

    let run = new_run(runtime.clone(), &base).with_sink(sink);
    let broker = run.questions().unwrap();
    let _ = broker_slot.set(broker.clone());
    let report = run
        .execute(&issue(), &repository(), CancellationToken::new())
        .await
        .unwrap();

    let responses = runtime.responses.lock().unwrap();
    assert!(responses[0].is_error);
    assert!(responses[0].text().contains("question was cancelled"));
    assert_eq!(broker.pending_count(), 0);

    let events = events.lock().unwrap();
    let result_ok = events.iter().find_map(|e| match e {
        AgentEvent::ToolResult { success, .. } => Some(*success),
        _ => None,
    });
    assert_eq!(result_ok, Some(false));
    assert_eq!(events.last().map(AgentEvent::kind), Some("complete"));
    assert!(matches!(report.status, ReportStatus::NeedsHuman { .. }));
    assert!(is_empty_dir(base.path()));
}
