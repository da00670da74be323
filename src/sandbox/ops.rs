//! Stateless sandbox operations.
//!
//! Each operation takes the run's [`SandboxSession`], checks it is
//! initialized before touching the remote side, and returns a typed result.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

use super::provider::{CommandOutput, CommandRequest};
use super::session::SandboxSession;

/// Ceiling for `git clone`.
pub const CLONE_TIMEOUT: Duration = Duration::from_secs(120);

/// Ceiling for internal git and search commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum search result lines returned to the agent.
pub const MAX_SEARCH_RESULTS: usize = 200;

/// Quotes a string for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Puts `token` into the host segment of an https clone URL.
pub fn inject_token(url: &str, token: Option<&str>) -> String {
    match (token, url.strip_prefix("https://")) {
        (Some(token), Some(rest)) if !token.is_empty() && !rest.contains('@') => {
            format!("https://x-access-token:{}@{}", token, rest)
        }
        _ => url.to_string(),
    }
}

/// Local directory name for a clone URL: last path segment without `.git`.
pub fn repo_dir_name(url: &str) -> String {
    let name = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or("")
        .trim_end_matches(".git");
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "repo".to_string()
    } else {
        sanitized
    }
}

fn redact(text: &str, token: Option<&str>) -> String {
    match token {
        Some(t) if !t.is_empty() => text.replace(t, "***"),
        _ => text.to_string(),
    }
}

/// Clones `url` into the sandbox home and records the path on the session.
pub async fn clone_repo(
    session: &SandboxSession,
    url: &str,
    branch: Option<&str>,
) -> Result<String, SandboxError> {
    let handle = session.handle()?;
    if let Some(existing) = session.repo_path() {
        return Err(SandboxError::Operation(format!(
            "a repository is already cloned at {}",
            existing
        )));
    }

    let token = session.config().github_token.as_deref();
    let path = format!(
        "{}/{}",
        handle.home_dir().trim_end_matches('/'),
        repo_dir_name(url)
    );

    let mut command = String::from("git clone");
    if let Some(branch) = branch {
        command.push_str(&format!(" --branch {}", shell_quote(branch)));
    }
    command.push_str(&format!(
        " {} {}",
        shell_quote(&inject_token(url, token)),
        shell_quote(&path)
    ));

    tracing::info!(url = %url, path = %path, branch = ?branch, "cloning repository");

    let out = handle
        .run(CommandRequest::new(command, CLONE_TIMEOUT))
        .await
        .map_err(|e| match e {
            SandboxError::Timeout { .. } => SandboxError::Timeout {
                operation: "git clone".to_string(),
                seconds: CLONE_TIMEOUT.as_secs(),
            },
            SandboxError::Operation(msg) => SandboxError::Operation(redact(&msg, token)),
            other => other,
        })?;

    if !out.success() {
        return Err(SandboxError::Operation(format!(
            "git clone failed: {}",
            redact(out.stderr.trim(), token)
        )));
    }

    session.set_repo_path(path.clone());
    Ok(path)
}

/// Runs a shell command. A non-zero exit code is returned as data.
///
/// Without an explicit `timeout`, `sandbox.command_timeout_secs` applies.
pub async fn run_command(
    session: &SandboxSession,
    command: &str,
    timeout: Option<Duration>,
    cwd: Option<&str>,
) -> Result<CommandOutput, SandboxError> {
    let handle = session.handle()?;
    let cwd = match cwd {
        Some(dir) => session.resolve_path(dir)?,
        None => session.working_dir()?,
    };
    handle
        .run(CommandRequest::new(command, timeout.unwrap_or_else(|| session.config().command_timeout())).in_dir(cwd))
        .await
}

/// Reads a file relative to the repository (or absolute).
pub async fn read_file(session: &SandboxSession, path: &str) -> Result<String, SandboxError> {
    let handle = session.handle()?;
    let resolved = session.resolve_path(path)?;
    handle.read_file(&resolved).await
}

/// Replaces a file's content wholesale. Returns the resolved path.
pub async fn write_file(
    session: &SandboxSession,
    path: &str,
    content: &str,
) -> Result<String, SandboxError> {
    let handle = session.handle()?;
    let resolved = session.resolve_path(path)?;
    handle.write_file(&resolved, content.as_bytes()).await?;
    tracing::debug!(path = %resolved, bytes = content.len(), "wrote file");
    Ok(resolved)
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Lists a directory; defaults to the repository root.
pub async fn list_directory(
    session: &SandboxSession,
    path: Option<&str>,
) -> Result<Vec<DirEntry>, SandboxError> {
    let handle = session.handle()?;
    let resolved = match path {
        Some(p) => session.resolve_path(p)?,
        None => session.working_dir()?,
    };

    let out = handle
        .run(CommandRequest::new(
            format!("ls -1Ap {}", shell_quote(&resolved)),
            DEFAULT_COMMAND_TIMEOUT,
        ))
        .await?;
    if !out.success() {
        return Err(SandboxError::Operation(format!(
            "cannot list {}: {}",
            resolved,
            out.stderr.trim()
        )));
    }

    Ok(out
        .stdout
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_suffix('/') {
            Some(dir) => DirEntry {
                name: dir.to_string(),
                is_dir: true,
            },
            None => DirEntry {
                name: line.to_string(),
                is_dir: false,
            },
        })
        .collect())
}

/// Search result lines (`path:line:text`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SearchResult {
    pub matches: Vec<String>,
    pub truncated: bool,
}

/// Builds the search command: ripgrep when installed, grep otherwise.
fn search_command(pattern: &str, path: &str, glob: Option<&str>) -> String {
    let pattern = shell_quote(pattern);
    let path = shell_quote(path);
    let (rg_glob, grep_glob) = match glob {
        Some(g) => (
            format!(" --glob {}", shell_quote(g)),
            format!(" --include={}", shell_quote(g)),
        ),
        None => (String::new(), String::new()),
    };
    format!(
        "if command -v rg >/dev/null 2>&1; then rg --line-number --no-heading --color never{rg_glob} -e {pattern} {path}; \
         else grep -rnI --exclude-dir=.git --exclude-dir=node_modules{grep_glob} -e {pattern} {path}; fi"
    )
}

/// Searches file contents. Zero matches is a successful empty result.
pub async fn search(
    session: &SandboxSession,
    pattern: &str,
    path: Option<&str>,
    glob: Option<&str>,
) -> Result<SearchResult, SandboxError> {
    let handle = session.handle()?;
    let root = match path {
        Some(p) => session.resolve_path(p)?,
        None => session.working_dir()?,
    };

    let out = handle
        .run(CommandRequest::new(
            search_command(pattern, &root, glob),
            DEFAULT_COMMAND_TIMEOUT,
        ))
        .await?;

    match out.exit_code {
        0 => {}
        1 => return Ok(SearchResult::default()),
        _ => {
            return Err(SandboxError::Operation(format!(
                "search failed: {}",
                out.stderr.trim()
            )))
        }
    }

    let mut matches: Vec<String> = out
        .stdout
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let truncated = matches.len() > MAX_SEARCH_RESULTS;
    matches.truncate(MAX_SEARCH_RESULTS);
    Ok(SearchResult { matches, truncated })
}
