//! Final report reconciliation.
//!
//! The agent ends its run with a JSON status block somewhere in free text.
//! [`build_report`] finds it, fills defaults for omitted fields and falls
//! back to a conservative status when nothing parses.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::github::{Issue, Repository};

pub const DEFAULT_SUMMARY: &str = "No summary provided";
pub const DEFAULT_FIX_DESCRIPTION: &str = "Fix applied";
pub const DEFAULT_FIXING_COMMIT: &str = "unknown";
pub const DEFAULT_REMAINING_WORK: &str = "Additional work needed";
pub const DEFAULT_BLOCKER: &str = "Requires human review";
pub const DEFAULT_ERROR: &str = "Agent failed";

const FAILED_SUMMARY_CHARS: usize = 200;

/// Terminal status. Every variant carries its required extra field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportStatus {
    Solved {
        summary: String,
        #[serde(rename = "fixDescription")]
        fix_description: String,
    },
    AlreadyFixed {
        summary: String,
        #[serde(rename = "fixingCommit")]
        fixing_commit: String,
    },
    Partial {
        summary: String,
        #[serde(rename = "remainingWork")]
        remaining_work: String,
    },
    NeedsHuman {
        summary: String,
        blockers: Vec<String>,
    },
    Failed {
        summary: String,
        error: String,
    },
}

impl ReportStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ReportStatus::Solved { .. } => "solved",
            ReportStatus::AlreadyFixed { .. } => "already_fixed",
            ReportStatus::Partial { .. } => "partial",
            ReportStatus::NeedsHuman { .. } => "needs_human",
            ReportStatus::Failed { .. } => "failed",
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            ReportStatus::Solved { summary, .. }
            | ReportStatus::AlreadyFixed { summary, .. }
            | ReportStatus::Partial { summary, .. }
            | ReportStatus::NeedsHuman { summary, .. }
            | ReportStatus::Failed { summary, .. } => summary,
        }
    }

    /// Solved, or nothing left to fix.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ReportStatus::Solved { .. } | ReportStatus::AlreadyFixed { .. }
        )
    }
}

/// The terminal artifact of a run. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub issue: Issue,
    pub repository: Repository,
    pub status: ReportStatus,
    pub reproduced: bool,
    pub root_cause: Option<String>,
    /// Full final text of the agent.
    pub analysis: String,
    pub files_changed: Vec<String>,
    pub preview_url: Option<String>,
    pub turns: u32,
    pub duration: Duration,
    pub cost_usd: f64,
}

/// Status block as the agent writes it. Only `status` is required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBlock {
    status: String,
    summary: Option<String>,
    #[serde(alias = "fix_description")]
    fix_description: Option<String>,
    #[serde(alias = "fixing_commit")]
    fixing_commit: Option<String>,
    #[serde(alias = "remaining_work")]
    remaining_work: Option<String>,
    blockers: Option<Vec<String>>,
    error: Option<String>,
    reproduced: Option<bool>,
    #[serde(alias = "root_cause")]
    root_cause: Option<String>,
    #[serde(alias = "files_changed")]
    files_changed: Option<Vec<String>>,
}

impl StatusBlock {
    fn to_status(&self) -> Option<ReportStatus> {
        let summary = self
            .summary
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUMMARY.to_string());
        let status = match normalize_status(&self.status)? {
            "solved" => ReportStatus::Solved {
                summary,
                fix_description: self
                    .fix_description
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FIX_DESCRIPTION.to_string()),
            },
            "already_fixed" => ReportStatus::AlreadyFixed {
                summary,
                fixing_commit: self
                    .fixing_commit
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FIXING_COMMIT.to_string()),
            },
            "partial" => ReportStatus::Partial {
                summary,
                remaining_work: self
                    .remaining_work
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REMAINING_WORK.to_string()),
            },
            "needs_human" => ReportStatus::NeedsHuman {
                summary,
                blockers: self
                    .blockers
                    .clone()
                    .filter(|b| !b.is_empty())
                    .unwrap_or_else(|| vec![DEFAULT_BLOCKER.to_string()]),
            },
            _ => ReportStatus::Failed {
                summary,
                error: self.error.clone().unwrap_or_else(|| DEFAULT_ERROR.to_string()),
            },
        };
        Some(status)
    }
}

fn normalize_status(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
        "solved" | "fixed" => Some("solved"),
        "already_fixed" => Some("already_fixed"),
        "partial" => Some("partial"),
        "needs_human" => Some("needs_human"),
        "failed" => Some("failed"),
        _ => None,
    }
}

/// Inputs gathered by the run.
#[derive(Debug, Clone)]
pub struct ReportInput {
    pub text: String,
    pub is_error: bool,
    pub turns: u32,
    pub duration: Duration,
    pub cost_usd: f64,
    pub preview_url: Option<String>,
    pub issue: Issue,
    pub repository: Repository,
}

pub fn build_report(input: ReportInput) -> AgentReport {
    let parsed = extract_status_block(&input.text);
    let found_block = parsed.is_some();

    let (status, reproduced, root_cause, files_changed) = match parsed {
        Some((block_status, block)) => (
            block_status,
            block.reproduced.unwrap_or(false),
            block.root_cause,
            block.files_changed.unwrap_or_default(),
        ),
        None => (fallback_status(&input.text, input.is_error), false, None, Vec::new()),
    };

    tracing::debug!(status = status.name(), found_block, "built report");

    AgentReport {
        issue: input.issue,
        repository: input.repository,
        status,
        reproduced,
        root_cause,
        analysis: input.text,
        files_changed,
        preview_url: input.preview_url,
        turns: input.turns,
        duration: input.duration,
        cost_usd: input.cost_usd,
    }
}

fn fallback_status(text: &str, is_error: bool) -> ReportStatus {
    if is_error {
        let preview: String = text.trim().chars().take(FAILED_SUMMARY_CHARS).collect();
        ReportStatus::Failed {
            summary: if preview.is_empty() {
                DEFAULT_SUMMARY.to_string()
            } else {
                preview
            },
            error: DEFAULT_ERROR.to_string(),
        }
    } else {
        ReportStatus::NeedsHuman {
            summary: "Could not parse agent output".to_string(),
            blockers: vec!["Agent output did not contain a parseable status block".to_string()],
        }
    }
}

fn parse_block(candidate: &str) -> Option<(ReportStatus, StatusBlock)> {
    let block: StatusBlock = serde_json::from_str(candidate.trim()).ok()?;
    let status = block.to_status()?;
    Some((status, block))
}

/// Tries, in order: `json` fences, any fence, then a brace-balanced object
/// around the first `"status"` key. Later fences win within a tier.
fn extract_status_block(text: &str) -> Option<(ReportStatus, StatusBlock)> {
    let fences = fenced_blocks(text);

    fences
        .iter()
        .rev()
        .filter(|(lang, _)| lang == "json")
        .find_map(|(_, body)| parse_block(body))
        .or_else(|| fences.iter().rev().find_map(|(_, body)| parse_block(body)))
        .or_else(|| balanced_candidates(text).into_iter().find_map(parse_block))
}

/// `(language, body)` for every closed ``` fence.
fn fenced_blocks(text: &str) -> Vec<(String, &str)> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(line_end) = after.find('\n') else { break };
        let lang = after[..line_end].trim().to_ascii_lowercase();
        let body_start = &after[line_end + 1..];
        let Some(close) = body_start.find("```") else { break };
        blocks.push((lang, &body_start[..close]));
        rest = &body_start[close + 3..];
    }
    blocks
}

fn status_key() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""status"\s*:"#).expect("static regex"))
}

/// Objects enclosing the first `"status":` key, innermost first.
fn balanced_candidates(text: &str) -> Vec<&str> {
    let Some(found) = status_key().find(text) else {
        return Vec::new();
    };
    text[..found.start()]
        .char_indices()
        .rev()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(start, _)| {
            balanced_end(text, start)
                .filter(|end| *end >= found.end())
                .map(|end| &text[start..=end])
        })
        .collect()
}

/// Index of the `}` closing the `{` at `start`, skipping braces inside strings.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}
