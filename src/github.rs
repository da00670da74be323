//! GitHub issue lookup.
//!
//! Parses issue URLs and fetches the two immutable records a run needs:
//! the [`Issue`] (with comments) and its [`Repository`].

use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{Error, GitHubError, Result};

const GITHUB_API_URL: &str = "https://api.github.com";
const MAX_ERROR_BODY_LEN: usize = 200;

/// Coordinates of an issue parsed from its URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl IssueRef {
    /// Parses `https://github.com/{owner}/{repo}/issues/{n}`.
    ///
    /// The scheme and `www.` are optional; a trailing slash, query or fragment
    /// is tolerated. `n` must be a positive integer without leading zeros.
    pub fn parse(url: &str) -> Result<Self> {
        static ISSUE_URL: OnceLock<Regex> = OnceLock::new();
        let re = ISSUE_URL.get_or_init(|| {
            Regex::new(
                r"^(?:https?://)?(?:www\.)?github\.com/([A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)/([A-Za-z0-9_.-]+)/issues/([1-9][0-9]*)/?(?:[?#].*)?$",
            )
            .expect("issue URL pattern is valid")
        });

        let trimmed = url.trim();
        let caps = re
            .captures(trimmed)
            .ok_or_else(|| Error::InvalidIssueUrl(url.to_string()))?;

        let repo = caps[2].to_string();
        if repo == "." || repo == ".." {
            return Err(Error::InvalidIssueUrl(url.to_string()));
        }
        let number = caps[3]
            .parse::<u64>()
            .map_err(|_| Error::InvalidIssueUrl(url.to_string()))?;

        Ok(Self {
            owner: caps[1].to_string(),
            repo,
            number,
        })
    }

    /// Canonical URL for this issue.
    pub fn url(&self) -> String {
        format!(
            "https://github.com/{}/{}/issues/{}",
            self.owner, self.repo, self.number
        )
    }
}

/// A comment on an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Issue record, fetched once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub labels: Vec<String>,
    pub comments: Vec<Comment>,
    pub url: String,
}

/// Repository coordinates for the issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub clone_url: String,
    pub private: bool,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    html_url: String,
}

#[derive(Deserialize)]
struct ApiComment {
    user: Option<ApiUser>,
    body: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ApiRepository {
    name: String,
    owner: ApiUser,
    default_branch: String,
    clone_url: String,
    #[serde(default)]
    private: bool,
}

/// Minimal GitHub REST client.
pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GitHubClient {
    /// Creates a client against api.github.com.
    pub fn new(token: Option<String>) -> Self {
        Self::with_base_url(GITHUB_API_URL, token)
    }

    /// Creates a client against a custom API root (GitHub Enterprise).
    pub fn with_base_url(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    /// Fetches the issue, its comments, and the repository.
    pub async fn fetch(&self, issue_ref: &IssueRef) -> Result<(Issue, Repository)> {
        let base = format!(
            "{}/repos/{}/{}",
            self.base_url, issue_ref.owner, issue_ref.repo
        );

        let repo: ApiRepository = self
            .get_json(&base, &format!("repository {}/{}", issue_ref.owner, issue_ref.repo))
            .await?;
        let issue: ApiIssue = self
            .get_json(
                &format!("{}/issues/{}", base, issue_ref.number),
                &format!("issue #{}", issue_ref.number),
            )
            .await?;
        let comments: Vec<ApiComment> = self
            .get_json(
                &format!("{}/issues/{}/comments?per_page=100", base, issue_ref.number),
                &format!("comments for issue #{}", issue_ref.number),
            )
            .await?;

        tracing::info!(
            repo = %format!("{}/{}", issue_ref.owner, issue_ref.repo),
            issue = issue.number,
            comments = comments.len(),
            "fetched issue"
        );

        let issue = Issue {
            number: issue.number,
            title: issue.title,
            body: issue.body,
            state: issue.state,
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            comments: comments
                .into_iter()
                .map(|c| Comment {
                    author: c
                        .user
                        .map(|u| u.login)
                        .unwrap_or_else(|| "ghost".to_string()),
                    body: c.body.unwrap_or_default(),
                    created_at: c.created_at,
                })
                .collect(),
            url: issue.html_url,
        };

        let repository = Repository {
            owner: repo.owner.login,
            name: repo.name,
            default_branch: repo.default_branch,
            clone_url: repo.clone_url,
            private: repo.private,
        };

        Ok((issue, repository))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str, what: &str) -> Result<T> {
        let mut request = self
            .http
            .get(url)
            .header(USER_AGENT, "issue-fixer")
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| GitHubError::Http(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| GitHubError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_failure(status, &headers, &text, what).into());
        }

        serde_json::from_str(&text).map_err(|e| {
            GitHubError::Api {
                status: status.as_u16(),
                message: format!("unexpected response shape: {}", e),
            }
            .into()
        })
    }
}

/// Maps a non-success GitHub response onto the error taxonomy.
fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &str, what: &str) -> GitHubError {
    let remaining = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    if matches!(status.as_u16(), 403 | 429) && (remaining == Some(0) || status.as_u16() == 429) {
        let reset_at = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        return GitHubError::RateLimited { reset_at };
    }

    match status.as_u16() {
        401 | 403 => GitHubError::Auth,
        404 => GitHubError::NotFound(what.to_string()),
        code => GitHubError::Api {
            status: code,
            message: truncate(body, MAX_ERROR_BODY_LEN),
        },
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}... (truncated)", cut)
    }
}
