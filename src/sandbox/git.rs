//! Git history operations, including automated bisection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

use super::ops::{shell_quote, DEFAULT_COMMAND_TIMEOUT};
use super::provider::{CommandOutput, CommandRequest};
use super::session::SandboxSession;

/// Default step ceiling for [`bisect_run`].
pub const DEFAULT_BISECT_STEPS: u32 = 20;

/// Ceiling for one test-command execution during bisection.
pub const BISECT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

const FIELD_SEP: char = '\u{1f}';
const FIRST_BAD_MARKER: &str = "is the first bad commit";

/// One commit from `git log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    /// Author date, strict ISO 8601.
    pub date: String,
    pub subject: String,
}

/// How to mark the current bisection commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BisectMark {
    Good,
    Bad,
    Skip,
}

impl BisectMark {
    pub fn as_str(&self) -> &'static str {
        match self {
            BisectMark::Good => "good",
            BisectMark::Bad => "bad",
            BisectMark::Skip => "skip",
        }
    }

    /// Classifies a test exit code the way `git bisect run` does.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => BisectMark::Good,
            125 => BisectMark::Skip,
            _ => BisectMark::Bad,
        }
    }
}

/// Result of an automated bisection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BisectOutcome {
    pub found_commit: Option<String>,
    pub steps: u32,
    pub log: Vec<String>,
    /// The step ceiling was reached before a single commit was isolated.
    pub inconclusive: bool,
}

/// Runs `git <args>` in the repository.
async fn git(
    session: &SandboxSession,
    args: &str,
    timeout: Duration,
) -> Result<CommandOutput, SandboxError> {
    let handle = session.handle()?;
    let repo = session.resolve_path(".")?;
    handle
        .run(CommandRequest::new(format!("git {}", args), timeout).in_dir(repo))
        .await
}

/// Like [`git`] but a non-zero exit is an `Operation` error.
async fn git_text(session: &SandboxSession, args: &str) -> Result<String, SandboxError> {
    let out = git(session, args, DEFAULT_COMMAND_TIMEOUT).await?;
    if !out.success() {
        return Err(SandboxError::Operation(format!(
            "git {} failed: {}",
            args.split_whitespace().take(2).collect::<Vec<_>>().join(" "),
            out.combined()
        )));
    }
    Ok(out.combined())
}

/// Commits since `since` (any date `git log --since` accepts), newest first,
/// optionally filtered by a case-insensitive keyword in the subject.
pub async fn log_since(
    session: &SandboxSession,
    since: &str,
    keyword: Option<&str>,
) -> Result<Vec<CommitInfo>, SandboxError> {
    let args = format!(
        "log --since={} --format=%H%x1f%aI%x1f%s",
        shell_quote(since)
    );
    let out = git(session, &args, DEFAULT_COMMAND_TIMEOUT).await?;
    if !out.success() {
        return Err(SandboxError::Operation(format!(
            "git log failed: {}",
            out.stderr.trim()
        )));
    }

    let needle = keyword.map(str::to_lowercase);
    Ok(out
        .stdout
        .lines()
        .filter_map(parse_log_line)
        .filter(|c| match &needle {
            Some(k) => c.subject.to_lowercase().contains(k),
            None => true,
        })
        .collect())
}

fn parse_log_line(line: &str) -> Option<CommitInfo> {
    let mut parts = line.splitn(3, FIELD_SEP);
    let hash = parts.next()?.trim();
    let date = parts.next()?;
    let subject = parts.next().unwrap_or("");
    if hash.is_empty() {
        return None;
    }
    Some(CommitInfo {
        hash: hash.to_string(),
        date: date.to_string(),
        subject: subject.to_string(),
    })
}

/// Checks out `reference`. A failed checkout reports git's stderr.
pub async fn checkout(session: &SandboxSession, reference: &str) -> Result<String, SandboxError> {
    let command = format!("checkout {}", shell_quote(reference));
    let out = git(session, &command, DEFAULT_COMMAND_TIMEOUT).await?;
    if !out.success() {
        return Err(SandboxError::NonZeroExit {
            command: format!("git {}", command),
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(out.combined())
}

pub async fn bisect_start(
    session: &SandboxSession,
    bad: &str,
    good: &str,
) -> Result<String, SandboxError> {
    git_text(
        session,
        &format!("bisect start {} {}", shell_quote(bad), shell_quote(good)),
    )
    .await
}

/// Marks `reference` (or the current commit) good, bad or skipped.
pub async fn bisect_mark(
    session: &SandboxSession,
    mark: BisectMark,
    reference: Option<&str>,
) -> Result<String, SandboxError> {
    let args = match reference {
        Some(r) => format!("bisect {} {}", mark.as_str(), shell_quote(r)),
        None => format!("bisect {}", mark.as_str()),
    };
    git_text(session, &args).await
}

pub async fn bisect_reset(session: &SandboxSession) -> Result<String, SandboxError> {
    git_text(session, "bisect reset").await
}

/// Extracts the hash from git's "<hash> is the first bad commit" line.
fn first_bad_commit(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains(FIRST_BAD_MARKER))
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// Bisects between `bad` and `good`, classifying each step by the exit code
/// of `test_command`.
///
/// The bisection is reset before returning on every path. A failing reset
/// is logged and does not change the result.
pub async fn bisect_run(
    session: &SandboxSession,
    bad: &str,
    good: &str,
    test_command: &str,
    max_steps: Option<u32>,
) -> Result<BisectOutcome, SandboxError> {
    session.handle()?;

    let result = drive_bisect(
        session,
        bad,
        good,
        test_command,
        max_steps.unwrap_or(DEFAULT_BISECT_STEPS),
    )
    .await;

    if let Err(e) = bisect_reset(session).await {
        tracing::warn!(error = %e, "bisect reset failed");
    }

    result
}

async fn drive_bisect(
    session: &SandboxSession,
    bad: &str,
    good: &str,
    test_command: &str,
    max_steps: u32,
) -> Result<BisectOutcome, SandboxError> {
    let mut outcome = BisectOutcome::default();

    let started = bisect_start(session, bad, good).await?;
    outcome.log.push(format!("start: {}", first_line(&started)));
    if let Some(hash) = first_bad_commit(&started) {
        outcome.found_commit = Some(hash);
        return Ok(outcome);
    }

    let handle = session.handle()?;
    let repo = session.resolve_path(".")?;

    while outcome.steps < max_steps {
        outcome.steps += 1;
        let test = handle
            .run(CommandRequest::new(test_command, BISECT_STEP_TIMEOUT).in_dir(repo.clone()))
            .await?;
        let mark = BisectMark::from_exit_code(test.exit_code);
        let marked = bisect_mark(session, mark, None).await?;

        outcome.log.push(format!(
            "step {}: exit {} -> {}: {}",
            outcome.steps,
            test.exit_code,
            mark.as_str(),
            first_line(&marked)
        ));
        tracing::debug!(step = outcome.steps, exit_code = test.exit_code, mark = mark.as_str(), "bisect step");

        if let Some(hash) = first_bad_commit(&marked) {
            tracing::info!(commit = %hash, steps = outcome.steps, "bisect found first bad commit");
            outcome.found_commit = Some(hash);
            return Ok(outcome);
        }
    }

    outcome.inconclusive = true;
    Ok(outcome)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}
