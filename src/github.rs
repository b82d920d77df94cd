use std::time::Duration;

use anyhow::{Context, bail};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone)]
pub struct PrContext {
    pub repo: String,
    pub number: u64,
    pub base_ref: String,
    pub base_branch: String,
    pub head_sha: String,
    pub title: String,
    pub draft: bool,
    pub labels: Vec<String>,
    pub author_login: String,
}

#[derive(Debug, Clone)]
pub struct CheckRunSummary {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommentSummary {
    pub author: String,
    pub body: String,
}

/// Everything the prompt builder gets to see about the pull request.
#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub pr: PrContext,
    pub check_runs: Vec<CheckRunSummary>,
    pub comments: Vec<CommentSummary>,
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    pull_request: PullRequest,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    base: RefBranch,
    head: HeadBranch,
    title: Option<String>,
    draft: Option<bool>,
    labels: Option<Vec<LabelInfo>>,
    user: Option<UserInfo>,
}

#[derive(Debug, Deserialize)]
struct RefBranch {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct HeadBranch {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct LabelInfo {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    login: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueComment {
    body: Option<String>,
    user: Option<UserInfo>,
}

#[derive(Debug, Deserialize)]
struct CheckRunsPage {
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
}

pub fn read_pr_context(event_path: &str, repo: &str) -> anyhow::Result<PrContext> {
    let event_data = std::fs::read_to_string(event_path)
        .with_context(|| format!("failed to read event payload at {event_path}"))?;

    let parsed: PullRequestEvent =
        serde_json::from_str(&event_data).context("failed to parse pull_request event payload")?;

    Ok(PrContext {
        repo: repo.to_string(),
        number: parsed.pull_request.number,
        base_ref: format!("origin/{}", parsed.pull_request.base.branch),
        base_branch: parsed.pull_request.base.branch,
        head_sha: parsed.pull_request.head.sha,
        title: parsed.pull_request.title.unwrap_or_default(),
        draft: parsed.pull_request.draft.unwrap_or(false),
        labels: parsed
            .pull_request
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(|l| l.name)
            .collect(),
        author_login: parsed
            .pull_request
            .user
            .and_then(|u| u.login)
            .unwrap_or_default(),
    })
}

/// Gather the full review context. The event payload is required; the API
/// fetches degrade to empty lists on failure so one flaky endpoint cannot
/// kill the review.
pub fn collect_review_context(
    token: &str,
    event_path: &str,
    repo: &str,
    max_comment_history: usize,
) -> anyhow::Result<ReviewContext> {
    let pr = read_pr_context(event_path, repo)?;
    let api_base = api_base();

    let check_runs = match fetch_check_runs(token, &pr, &api_base) {
        Ok(runs) => runs,
        Err(err) => {
            eprintln!("Check-run status skipped: {err:#}");
            Vec::new()
        }
    };

    let comments = if max_comment_history == 0 {
        Vec::new()
    } else {
        match fetch_comment_history(token, &pr, max_comment_history, &api_base) {
            Ok(comments) => comments,
            Err(err) => {
                eprintln!("Comment history skipped: {err:#}");
                Vec::new()
            }
        }
    };

    Ok(ReviewContext {
        pr,
        check_runs,
        comments,
    })
}

fn api_base() -> String {
    std::env::var("AI_REVIEW_GITHUB_API_BASE")
        .unwrap_or_else(|_| "https://api.github.com".to_string())
}

pub fn fetch_check_runs(
    token: &str,
    ctx: &PrContext,
    api_base: &str,
) -> anyhow::Result<Vec<CheckRunSummary>> {
    let client = new_http_client(api_base)?;
    let url = format!(
        "{}/repos/{}/commits/{}/check-runs?per_page=100",
        api_base.trim_end_matches('/'),
        ctx.repo,
        ctx.head_sha
    );

    let response = with_headers(client.get(&url), token)
        .send()
        .context("failed to list check runs")?;
    if !response.status().is_success() {
        bail!("failed to list check runs: HTTP {}", response.status());
    }

    let page: CheckRunsPage = response
        .json()
        .context("failed to decode check runs response")?;

    Ok(page
        .check_runs
        .into_iter()
        .map(|run| CheckRunSummary {
            name: run.name,
            status: run.status,
            conclusion: run.conclusion,
        })
        .collect())
}

/// Most recent `limit` issue comments, oldest first.
pub fn fetch_comment_history(
    token: &str,
    ctx: &PrContext,
    limit: usize,
    api_base: &str,
) -> anyhow::Result<Vec<CommentSummary>> {
    let client = new_http_client(api_base)?;
    let url = format!(
        "{}/repos/{}/issues/{}/comments",
        api_base.trim_end_matches('/'),
        ctx.repo,
        ctx.number
    );

    let all: Vec<IssueComment> = fetch_paginated(&client, token, &url, "issue comments")?;

    let mut comments = all
        .into_iter()
        .filter_map(|comment| {
            let body = comment.body?;
            if body.trim().is_empty() {
                return None;
            }
            Some(CommentSummary {
                author: comment
                    .user
                    .and_then(|u| u.login)
                    .unwrap_or_else(|| "unknown".to_string()),
                body,
            })
        })
        .collect::<Vec<_>>();

    if comments.len() > limit {
        comments.drain(..comments.len() - limit);
    }

    Ok(comments)
}

fn append_pagination_params(url: &str, page: usize, per_page: usize) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}per_page={per_page}&page={page}")
}

fn fetch_paginated<T: DeserializeOwned>(
    client: &Client,
    token: &str,
    url: &str,
    label: &str,
) -> anyhow::Result<Vec<T>> {
    const PER_PAGE: usize = 100;
    const MAX_PAGES: usize = 1000;

    let mut all = Vec::new();
    let mut page = 1usize;
    loop {
        let paged_url = append_pagination_params(url, page, PER_PAGE);
        let response = with_headers(client.get(&paged_url), token)
            .send()
            .with_context(|| format!("failed to list {label} (page {page})"))?;
        if !response.status().is_success() {
            bail!("failed to list {label}: HTTP {}", response.status());
        }

        let mut items: Vec<T> = response
            .json()
            .with_context(|| format!("failed to decode {label} response (page {page})"))?;
        let count = items.len();
        all.append(&mut items);
        if count < PER_PAGE {
            break;
        }
        page += 1;
        if page > MAX_PAGES {
            bail!("failed to list {label}: exceeded pagination safety limit");
        }
    }

    Ok(all)
}

fn with_headers(
    request: reqwest::blocking::RequestBuilder,
    token: &str,
) -> reqwest::blocking::RequestBuilder {
    request
        .header(USER_AGENT, "ai-review")
        .header(ACCEPT, "application/vnd.github+json")
        .header(AUTHORIZATION, format!("Bearer {token}"))
}

fn new_http_client(api_base: &str) -> anyhow::Result<Client> {
    let mut builder = Client::builder().timeout(Duration::from_secs(30));
    if api_base.contains("://127.0.0.1")
        || api_base.contains("://localhost")
        || api_base.contains("://[::1]")
    {
        builder = builder.no_proxy();
    }
    builder.build().context("failed to build HTTP client")
}
