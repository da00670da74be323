//! Command-line surface: arguments and line-oriented event rendering.

use std::path::PathBuf;

use clap::Parser;

use crate::agent::{AgentEvent, AgentReport, ReportStatus};
use crate::config::{SandboxProviderKind, Settings};
use crate::error::Result;

/// Exit code for a run that ended solved or already fixed.
pub const EXIT_RESOLVED: i32 = 0;
/// Exit code for partial, needs_human and failed reports.
pub const EXIT_UNRESOLVED: i32 = 1;
/// Exit code when the run itself errored.
pub const EXIT_ERROR: i32 = 2;

const MAX_OUTPUT_PREVIEW: usize = 500;

#[derive(Parser, Debug)]
#[command(
    name = "issue-fixer",
    about = "Turn a GitHub issue into a verified fix inside a disposable sandbox",
    version
)]
pub struct Args {
    /// GitHub issue URL, e.g. https://github.com/owner/repo/issues/42
    pub issue_url: String,

    /// Model identifier (overrides config and ISSUE_FIXER_MODEL)
    #[arg(long)]
    pub model: Option<String>,

    /// Stop the agent after this many turns
    #[arg(long)]
    pub max_turns: Option<u32>,

    /// Extended-thinking token budget
    #[arg(long)]
    pub thinking_budget: Option<u32>,

    /// Sandbox backend
    #[arg(long, value_parser = parse_provider)]
    pub provider: Option<SandboxProviderKind>,

    /// Enable browser automation
    #[arg(long)]
    pub browser: bool,

    /// Path to a TOML config file (default: ./issue-fixer.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Stream partial thinking and message fragments as they arrive
    #[arg(long)]
    pub interactive: bool,

    /// Print events and the report as JSON lines
    #[arg(long)]
    pub json: bool,
}

fn parse_provider(s: &str) -> std::result::Result<SandboxProviderKind, String> {
    s.parse().map_err(|e: crate::error::ConfigError| e.user_message())
}

impl Args {
    /// Overlays flags onto loaded settings. Flags win over file and env.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(model) = &self.model {
            settings.agent.model = model.clone();
        }
        if let Some(max_turns) = self.max_turns {
            settings.agent.max_turns = Some(max_turns);
        }
        if let Some(budget) = self.thinking_budget {
            settings.agent.thinking_budget = budget;
        }
        if let Some(provider) = self.provider {
            settings.sandbox.provider = provider;
        }
        if self.browser {
            settings.sandbox.enable_browser = true;
        }
        if self.interactive {
            settings.agent.interactive = true;
        }
    }
}

/// Renders one event as a line of human-readable output.
///
/// Partial thinking and message fragments are not rendered here (see
/// [`format_fragment`]); `complete` is rendered through [`format_report`].
pub fn format_event(event: &AgentEvent) -> Option<String> {
    let line = match event {
        AgentEvent::PhaseChange { phase, .. } => format!("==> {}", phase),
        AgentEvent::TurnComplete { turn } => format!("--- turn {} ---", turn),
        AgentEvent::ToolCall { name, input, .. } => format!("[tool] {} {}", name, input),
        AgentEvent::ToolResult {
            name,
            success,
            output,
            ..
        } => {
            let mark = if *success { "ok" } else { "failed" };
            format!("[{} {}] {}", name, mark, preview(output))
        }
        AgentEvent::Thinking { partial: true, .. } | AgentEvent::Message { partial: true, .. } => {
            return None
        }
        AgentEvent::Thinking { text, .. } => format!("(thinking) {}", preview(text)),
        AgentEvent::Message { text, .. } => text.clone(),
        AgentEvent::AskUser {
            question, options, ..
        } => {
            if options.is_empty() {
                format!("[question] {}", question)
            } else {
                format!("[question] {} ({})", question, options.join(" / "))
            }
        }
        AgentEvent::Error { message } => format!("[error] {}", message),
        AgentEvent::Complete { .. } => return None,
    };
    Some(line)
}

/// Raw text of a partial message fragment, printed without a line break.
pub fn format_fragment(event: &AgentEvent) -> Option<&str> {
    match event {
        AgentEvent::Message {
            text,
            partial: true,
        } => Some(text),
        _ => None,
    }
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_OUTPUT_PREVIEW {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_OUTPUT_PREVIEW).collect();
    format!("{}...", cut)
}

/// Human-readable summary of a finished run.
pub fn format_report(report: &AgentReport) -> String {
    let mut out = format!(
        "\nIssue #{} in {}: {}\nStatus: {}\nSummary: {}\n",
        report.issue.number,
        report.repository.full_name(),
        report.issue.title,
        report.status.name(),
        report.status.summary()
    );

    match &report.status {
        ReportStatus::Solved {
            fix_description, ..
        } => out.push_str(&format!("Fix: {}\n", fix_description)),
        ReportStatus::AlreadyFixed { fixing_commit, .. } => {
            out.push_str(&format!("Fixed by: {}\n", fixing_commit))
        }
        ReportStatus::Partial { remaining_work, .. } => {
            out.push_str(&format!("Remaining: {}\n", remaining_work))
        }
        ReportStatus::NeedsHuman { blockers, .. } => {
            out.push_str("Blockers:\n");
            for blocker in blockers {
                out.push_str(&format!("  - {}\n", blocker));
            }
        }
        ReportStatus::Failed { error, .. } => out.push_str(&format!("Error: {}\n", error)),
    }

    out.push_str(&format!(
        "Reproduced: {}\n",
        if report.reproduced { "yes" } else { "no" }
    ));
    if let Some(cause) = &report.root_cause {
        out.push_str(&format!("Root cause: {}\n", cause));
    }
    if !report.files_changed.is_empty() {
        out.push_str(&format!("Files changed: {}\n", report.files_changed.join(", ")));
    }
    if let Some(url) = &report.preview_url {
        out.push_str(&format!("Preview: {}\n", url));
    }
    out.push_str(&format!(
        "Turns: {}  Duration: {}s  Cost: ${:.4}\n",
        report.turns,
        report.duration.as_secs(),
        report.cost_usd
    ));
    out
}

/// Maps a run outcome to the process exit code.
pub fn exit_code(outcome: &Result<AgentReport>) -> i32 {
    match outcome {
        Ok(report) if report.status.is_resolved() => EXIT_RESOLVED,
        Ok(_) => EXIT_UNRESOLVED,
        Err(_) => EXIT_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Phase;
    use crate::error::Error;
    use crate::github::{Issue, Repository};
    use std::time::Duration;

    fn report(status: ReportStatus) -> AgentReport {
        AgentReport {
            issue: Issue {
                number: 7,
                title: "Crash on empty input".to_string(),
                body: None,
                state: "open".to_string(),
                labels: Vec::new(),
                comments: Vec::new(),
                url: "https://github.com/octo/app/issues/7".to_string(),
            },
            repository: Repository {
                owner: "octo".to_string(),
                name: "app".to_string(),
                default_branch: "main".to_string(),
                clone_url: "https://github.com/octo/app.git".to_string(),
                private: false,
            },
            status,
            reproduced: true,
            root_cause: Some("unchecked index".to_string()),
            analysis: String::new(),
            files_changed: vec!["src/parse.rs".to_string()],
            preview_url: None,
            turns: 4,
            duration: Duration::from_secs(90),
            cost_usd: 0.125,
        }
    }

    #[test]
    fn flags_override_settings() {
        let args = Args::parse_from([
            "issue-fixer",
            "https://github.com/octo/app/issues/7",
            "--model",
            "claude-opus-4-1",
            "--max-turns",
            "12",
            "--provider",
            "local",
            "--browser",
            "--interactive",
        ]);
        let mut settings = Settings::default();
        args.apply(&mut settings);

        assert_eq!(settings.agent.model, "claude-opus-4-1");
        assert_eq!(settings.agent.max_turns, Some(12));
        assert_eq!(settings.sandbox.provider, SandboxProviderKind::Local);
        assert!(settings.sandbox.enable_browser);
        assert!(settings.agent.interactive);
        assert!(!args.json);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let parsed = Args::try_parse_from([
            "issue-fixer",
            "https://github.com/octo/app/issues/7",
            "--provider",
            "vm",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn partial_fragments_render_separately() {
        let partial = AgentEvent::Message {
            text: "Look".to_string(),
            partial: true,
        };
        assert_eq!(format_event(&partial), None);
        assert_eq!(format_fragment(&partial), Some("Look"));
        let thinking = AgentEvent::Thinking {
            text: "hmm".to_string(),
            partial: true,
        };
        assert_eq!(format_fragment(&thinking), None);
        assert_eq!(
            format_event(&AgentEvent::phase(Phase::Fixing)).as_deref(),
            Some("==> fixing")
        );
    }

    #[test]
    fn long_tool_output_is_truncated() {
        let event = AgentEvent::ToolResult {
            id: "toolu_1".to_string(),
            name: "sandbox_run_command".to_string(),
            success: true,
            output: "x".repeat(2000),
        };
        let line = format_event(&event).unwrap();
        assert!(line.starts_with("[sandbox_run_command ok] "));
        assert!(line.ends_with("..."));
        assert!(line.len() < 600);
    }

    #[test]
    fn report_lists_blockers() {
        let text = format_report(&report(ReportStatus::NeedsHuman {
            summary: "Need credentials".to_string(),
            blockers: vec!["No staging access".to_string()],
        }));
        assert!(text.contains("Status: needs_human"));
        assert!(text.contains("  - No staging access"));
        assert!(text.contains("Cost: $0.1250"));
    }

    #[test]
    fn exit_codes_follow_status() {
        let solved = report(ReportStatus::Solved {
            summary: "done".to_string(),
            fix_description: "guarded index".to_string(),
        });
        let partial = report(ReportStatus::Partial {
            summary: "half".to_string(),
            remaining_work: "tests".to_string(),
        });
        assert_eq!(exit_code(&Ok(solved)), EXIT_RESOLVED);
        assert_eq!(exit_code(&Ok(partial)), EXIT_UNRESOLVED);
        assert_eq!(exit_code(&Err(Error::Cancelled)), EXIT_ERROR);
    }
}
