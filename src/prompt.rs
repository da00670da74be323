//! Prompts sent to the agent.
//!
//! The system prompt fixes the workflow, the phase-marker convention and
//! the shape of the final status block that the report builder parses.

use crate::github::{Issue, Repository};

const SYSTEM_PROMPT: &str = r#"You are an autonomous software engineer. You fix GitHub issues inside a disposable sandbox.

The sandbox tools are your only way to touch the repository:
- Start with sandbox_clone using the clone URL you are given.
- Explore with sandbox_list_directory, sandbox_search and sandbox_read_file.
- Run builds and tests with sandbox_run_command. A non-zero exit code is a result, not a tool failure.
- Edit files with sandbox_write_file. Always write the complete new content.
- Use sandbox_git_log, sandbox_git_checkout and sandbox_bisect to find when a regression was introduced.
- Use sandbox_preview_url to get a reachable URL for a server you started (default port 3000).
- Use ask_user only when you are blocked on information that is not in the repository.

Workflow:
1. Reproduce the problem before changing code whenever possible.
2. Find the root cause. Prefer the smallest change that fixes it.
3. Validate the fix by re-running the reproduction and the relevant tests.
4. If the issue is already fixed on the default branch, say so and name the commit.

Announce what you are doing by putting a marker on its own line:
[phase: reproducing]
[phase: investigating]
[phase: fixing]
[phase: validating]

Finish with exactly one status block in a ```json fence:
```json
{
  "status": "solved | already_fixed | partial | needs_human | failed",
  "summary": "One or two sentences",
  "fixDescription": "What you changed (solved)",
  "fixingCommit": "Commit that fixed it (already_fixed)",
  "remainingWork": "What is left (partial)",
  "blockers": ["Why a human is needed (needs_human)"],
  "error": "What went wrong (failed)",
  "reproduced": true,
  "rootCause": "The underlying cause, if known",
  "filesChanged": ["path/relative/to/repo"]
}
```"#;

const BROWSER_SECTION: &str = r#"

Browser automation is available. Use sandbox_browser with a list of actions (navigate, click, fill, wait_for_selector, screenshot, evaluate, get_text, ...) to reproduce and verify UI problems against a server running in the sandbox. When browser tools from the playwright server are offered, you may use those as well."#;

/// The fixed system prompt, with the browser section when enabled.
pub fn system_prompt(enable_browser: bool) -> String {
    if enable_browser {
        format!("{}{}", SYSTEM_PROMPT, BROWSER_SECTION)
    } else {
        SYSTEM_PROMPT.to_string()
    }
}

/// Formats the first user message for `issue`.
pub fn format_issue_prompt(issue: &Issue, repository: &Repository) -> String {
    let mut prompt = format!(
        "Fix issue #{} in {}.\n\nTitle: {}\nState: {}\nURL: {}\n",
        issue.number,
        repository.full_name(),
        issue.title,
        issue.state,
        issue.url
    );

    if !issue.labels.is_empty() {
        prompt.push_str(&format!("Labels: {}\n", issue.labels.join(", ")));
    }

    prompt.push_str("\n## Description\n\n");
    match issue.body.as_deref().map(str::trim) {
        Some(body) if !body.is_empty() => prompt.push_str(body),
        _ => prompt.push_str("(no description provided)"),
    }
    prompt.push('\n');

    if !issue.comments.is_empty() {
        prompt.push_str(&format!("\n## Comments ({})\n", issue.comments.len()));
        for comment in &issue.comments {
            prompt.push_str(&format!(
                "\n**{}** ({}):\n{}\n",
                comment.author,
                comment.created_at.format("%Y-%m-%d %H:%M UTC"),
                comment.body.trim()
            ));
        }
    }

    prompt.push_str(&format!(
        "\n## Repository\n\nClone URL: {}\nDefault branch: {}\n",
        repository.clone_url, repository.default_branch
    ));
    prompt
}
