//! Typed wrapper over the GitHub REST and GraphQL APIs.
//!
//! The reconciler and prioritizer talk to the remote through the [`PrSource`]
//! trait so they can be exercised against an offline double; [`GitHubClient`]
//! is the live implementation. Review-state derivation (approval counting,
//! the user's own review status) lives in pure functions shared by both.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};

use crate::db::PrId;

const API_BASE: &str = "https://api.github.com";
const GRAPHQL_URL: &str = "https://api.github.com/graphql";
const SEARCH_PAGE_SIZE: u32 = 100;

/// The batched review query fetches at most this many reviews per PR.
/// An approval from a reviewer whose most recent state lives beyond this
/// window can be missed; full pagination is deliberately out of scope.
const REVIEW_PAGE_SIZE: u32 = 100;

/// Bound on any single remote HTTP call. Reconciliation passes must never
/// hang on a stuck connection.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the remote gateway. `RateLimited` is distinguished from
/// generic failures because callers preserve existing store values when they
/// see it; `NotFound` is distinguished because it means "PR gone" (cleanup),
/// not "try again".
#[derive(Debug)]
pub enum GitHubError {
    RateLimited { reset_at: Option<DateTime<Utc>> },
    NotFound,
    Api { status: StatusCode, message: String },
    Transport(reqwest::Error),
    Decode(String),
}

impl fmt::Display for GitHubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitHubError::RateLimited { reset_at: Some(at) } => {
                write!(f, "rate limited (resets at {})", at.format("%H:%M:%S"))
            }
            GitHubError::RateLimited { reset_at: None } => write!(f, "rate limited"),
            GitHubError::NotFound => write!(f, "not found"),
            GitHubError::Api { status, message } => {
                write!(f, "GitHub API error: {} - {}", status, message)
            }
            GitHubError::Transport(err) => write!(f, "request failed: {}", err),
            GitHubError::Decode(msg) => write!(f, "failed to decode response: {}", msg),
        }
    }
}

impl std::error::Error for GitHubError {}

impl From<reqwest::Error> for GitHubError {
    fn from(err: reqwest::Error) -> Self {
        GitHubError::Transport(err)
    }
}

impl GitHubError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GitHubError::RateLimited { .. })
    }
}

/// Core rate-limit bucket status.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

/// A PR as returned by the open-PR searches.
#[derive(Debug, Clone)]
pub struct PullRequestSummary {
    pub id: PrId,
    pub head_sha: String,
    pub title: String,
    pub author: String,
    pub url: String,
    pub created_at: Option<DateTime<Utc>>,
    pub draft: bool,
}

/// Per-PR result of the batched review query.
#[derive(Debug, Clone, Default)]
pub struct PrReviewData {
    pub approval_count: i64,
    /// The configured user's most recent non-dismissed, non-pending review
    /// state, or "" if they have none.
    pub my_review_status: String,
    pub draft: bool,
    pub ci_state: String,
    pub ci_failed_checks: Vec<String>,
}

/// Title/author/creation time, for the metadata backfill.
#[derive(Debug, Clone)]
pub struct PrMetadata {
    pub title: String,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Richer per-PR detail used by the priority scorer.
#[derive(Debug, Clone, Default)]
pub struct PrDetails {
    pub additions: i64,
    pub deletions: i64,
    pub changed_files: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub review_count: i64,
    pub requested_me: bool,
    pub draft: bool,
}

/// The remote PR source. The reconciler, prioritizer, and status surface
/// depend on this trait; [`GitHubClient`] is the live implementation and
/// tests provide an in-memory double.
#[async_trait]
pub trait PrSource: Send + Sync {
    /// Open PRs where the configured user is a requested reviewer.
    async fn search_review_requested(&self) -> Result<Vec<PullRequestSummary>, GitHubError>;

    /// Open PRs authored by the configured user.
    async fn search_mine(&self) -> Result<Vec<PullRequestSummary>, GitHubError>;

    async fn is_open(&self, id: &PrId) -> Result<bool, GitHubError>;

    async fn details(&self, id: &PrId) -> Result<PrMetadata, GitHubError>;

    async fn head_sha(&self, id: &PrId) -> Result<String, GitHubError>;

    /// Review data for many PRs: grouped by repository, one query per
    /// repository. Identities belonging to a repository whose query failed
    /// are absent from the map (rate-limited repositories in particular), so
    /// callers naturally preserve their existing values.
    async fn batch_review_data(
        &self,
        prs: &[PullRequestSummary],
    ) -> HashMap<PrId, PrReviewData>;

    /// Rich details for many PRs, same per-repository batching.
    async fn batch_details(&self, ids: &[PrId]) -> HashMap<PrId, PrDetails>;

    async fn rate_limit(&self) -> Result<RateLimitInfo, GitHubError>;
}

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    token: String,
    username: String,
}

impl GitHubClient {
    pub fn new(token: String, username: String) -> Self {
        let client = Client::builder()
            .user_agent(concat!("pr-review-server/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            token,
            username,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, GitHubError> {
        let response = self
            .client
            .get(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/vnd.github.v3+json")
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| GitHubError::Decode(e.to_string()))
    }

    async fn graphql<T: serde::de::DeserializeOwned>(&self, query: String) -> Result<T, GitHubError> {
        let body = serde_json::json!({ "query": query });
        let response = self
            .client
            .post(GRAPHQL_URL)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| GitHubError::Decode(e.to_string()))
    }

    async fn pull(&self, id: &PrId) -> Result<PullResponse, GitHubError> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}",
            API_BASE, id.repo_owner, id.repo_name, id.pr_number
        );
        self.get_json(&url).await
    }

    async fn search(&self, query: &str, label: &str) -> Result<Vec<PullRequestSummary>, GitHubError> {
        info!("GitHub search query ({}): {}", label, query);
        let url = format!(
            "{}/search/issues?q={}&per_page={}",
            API_BASE,
            query.replace(' ', "+"),
            SEARCH_PAGE_SIZE
        );
        let result: SearchResponse = self.get_json(&url).await?;
        info!(
            "GitHub search ({}) returned {} total results",
            label, result.total_count
        );

        let mut prs = Vec::new();
        for item in result.items {
            if item.pull_request.is_none() {
                continue;
            }
            let Some((owner, repo)) = parse_repo_from_url(&item.repository_url) else {
                warn!("Invalid repository URL: {}", item.repository_url);
                continue;
            };
            let id = PrId::new(&owner, &repo, item.number);

            // The search payload has no head sha; fetch the PR itself.
            let pull = match self.pull(&id).await {
                Ok(pull) => pull,
                Err(err) => {
                    warn!("Error fetching PR details for {}: {}", id, err);
                    continue;
                }
            };
            info!("Found PR ({}): {} - {}", label, id, pull.title.as_deref().unwrap_or(""));
            prs.push(summary_from_pull(id, pull));
        }
        Ok(prs)
    }

    async fn review_data_for_repo(
        &self,
        owner: &str,
        repo: &str,
        numbers: &[u64],
    ) -> Result<HashMap<PrId, PrReviewData>, GitHubError> {
        let query = build_review_data_query(owner, repo, numbers);
        let response: GraphQlResponse<ReviewAlias> = self.graphql(query).await?;
        let data = response.into_data()?;

        let mut results = HashMap::new();
        for (index, number) in numbers.iter().enumerate() {
            let alias = format!("pr{}", index);
            let Some(Some(node)) = data.get(&alias) else {
                warn!(
                    "Missing review data for {}/{}#{} in GraphQL response",
                    owner, repo, number
                );
                continue;
            };
            let Some(pr) = &node.pull_request else {
                continue;
            };
            let (approval_count, my_review_status) =
                summarize_reviews(&pr.reviews.nodes, &self.username);
            let rollup = pr
                .commits
                .nodes
                .first()
                .and_then(|edge| edge.commit.status_check_rollup.as_ref());
            let (ci_state, ci_failed_checks) = rollup_to_ci(rollup);

            results.insert(
                PrId::new(owner, repo, *number),
                PrReviewData {
                    approval_count,
                    my_review_status,
                    draft: pr.is_draft,
                    ci_state,
                    ci_failed_checks,
                },
            );
        }
        Ok(results)
    }

    async fn details_for_repo(
        &self,
        owner: &str,
        repo: &str,
        numbers: &[u64],
    ) -> Result<HashMap<PrId, PrDetails>, GitHubError> {
        let query = build_details_query(owner, repo, numbers);
        let response: GraphQlResponse<DetailsAlias> = self.graphql(query).await?;
        let data = response.into_data()?;

        let mut results = HashMap::new();
        for (index, number) in numbers.iter().enumerate() {
            let alias = format!("pr{}", index);
            let Some(Some(node)) = data.get(&alias) else {
                continue;
            };
            let Some(pr) = &node.pull_request else {
                continue;
            };
            let requested_me = pr.review_requests.nodes.iter().any(|req| {
                req.requested_reviewer
                    .as_ref()
                    .and_then(|r| r.login.as_deref())
                    == Some(self.username.as_str())
            });
            results.insert(
                PrId::new(owner, repo, *number),
                PrDetails {
                    additions: pr.additions,
                    deletions: pr.deletions,
                    changed_files: pr.changed_files,
                    created_at: pr.created_at,
                    review_count: pr.reviews.total_count,
                    requested_me,
                    draft: pr.is_draft,
                },
            );
        }
        Ok(results)
    }
}

#[async_trait]
impl PrSource for GitHubClient {
    async fn search_review_requested(&self) -> Result<Vec<PullRequestSummary>, GitHubError> {
        let query = format!("type:pr state:open review-requested:{}", self.username);
        self.search(&query, "review requested").await
    }

    async fn search_mine(&self) -> Result<Vec<PullRequestSummary>, GitHubError> {
        let query = format!("type:pr state:open author:{}", self.username);
        self.search(&query, "mine").await
    }

    async fn is_open(&self, id: &PrId) -> Result<bool, GitHubError> {
        let pull = self.pull(id).await?;
        Ok(pull.state == "open")
    }

    async fn details(&self, id: &PrId) -> Result<PrMetadata, GitHubError> {
        let pull = self.pull(id).await?;
        Ok(PrMetadata {
            title: pull.title.unwrap_or_default(),
            author: pull.user.map(|u| u.login).unwrap_or_default(),
            created_at: pull.created_at,
        })
    }

    async fn head_sha(&self, id: &PrId) -> Result<String, GitHubError> {
        let pull = self.pull(id).await?;
        Ok(pull.head.sha)
    }

    async fn batch_review_data(
        &self,
        prs: &[PullRequestSummary],
    ) -> HashMap<PrId, PrReviewData> {
        let mut results = HashMap::new();
        for ((owner, repo), numbers) in group_by_repo(prs.iter().map(|p| &p.id)) {
            info!(
                "Fetching review data for {} PRs in {}/{}",
                numbers.len(),
                owner,
                repo
            );
            match self.review_data_for_repo(&owner, &repo, &numbers).await {
                Ok(repo_data) => results.extend(repo_data),
                Err(err) if err.is_rate_limited() => {
                    warn!(
                        "Rate limited fetching review data for {}/{}; keeping existing values: {}",
                        owner, repo, err
                    );
                }
                Err(err) => {
                    warn!("Error fetching review data for {}/{}: {}", owner, repo, err);
                }
            }
        }
        info!(
            "Fetched review data for {}/{} PRs",
            results.len(),
            prs.len()
        );
        results
    }

    async fn batch_details(&self, ids: &[PrId]) -> HashMap<PrId, PrDetails> {
        let mut results = HashMap::new();
        for ((owner, repo), numbers) in group_by_repo(ids.iter()) {
            match self.details_for_repo(&owner, &repo, &numbers).await {
                Ok(repo_data) => results.extend(repo_data),
                Err(err) => {
                    warn!("Error fetching PR details for {}/{}: {}", owner, repo, err);
                }
            }
        }
        results
    }

    async fn rate_limit(&self) -> Result<RateLimitInfo, GitHubError> {
        let url = format!("{}/rate_limit", API_BASE);
        let response: RateLimitResponse = self.get_json(&url).await?;
        let core = response.resources.core;
        Ok(RateLimitInfo {
            limit: core.limit,
            remaining: core.remaining,
            reset_at: Utc
                .timestamp_opt(core.reset, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

/// Inspect a non-success response: 404 means the PR is gone, an exhausted
/// rate-limit bucket is a distinguished outcome, everything else carries the
/// status and body text.
async fn check_status(response: Response) -> Result<Response, GitHubError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(GitHubError::NotFound);
    }

    let remaining = header_i64(&response, "x-ratelimit-remaining");
    if remaining == Some(0) {
        let reset_at = header_i64(&response, "x-ratelimit-reset")
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        return Err(GitHubError::RateLimited { reset_at });
    }

    let message = response.text().await.unwrap_or_default();
    Err(GitHubError::Api { status, message })
}

fn header_i64(response: &Response, name: &str) -> Option<i64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Extract `(owner, repo)` from a repository API URL of the form
/// `https://api.github.com/repos/{owner}/{repo}`.
fn parse_repo_from_url(url: &str) -> Option<(String, String)> {
    let mut parts = url.rsplit('/');
    let repo = parts.next()?;
    let owner = parts.next()?;
    if repo.is_empty() || owner.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

fn summary_from_pull(id: PrId, pull: PullResponse) -> PullRequestSummary {
    let url = pull.html_url.unwrap_or_else(|| id.github_url());
    PullRequestSummary {
        head_sha: pull.head.sha,
        title: pull.title.unwrap_or_default(),
        author: pull.user.map(|u| u.login).unwrap_or_default(),
        url,
        created_at: pull.created_at,
        draft: pull.draft,
        id,
    }
}

fn group_by_repo<'a>(
    ids: impl Iterator<Item = &'a PrId>,
) -> BTreeMap<(String, String), Vec<u64>> {
    let mut groups: BTreeMap<(String, String), Vec<u64>> = BTreeMap::new();
    for id in ids {
        groups
            .entry((id.repo_owner.clone(), id.repo_name.clone()))
            .or_default()
            .push(id.pr_number);
    }
    groups
}

// ---------------------------------------------------------------------------
// Review-state derivation (shared with offline doubles)
// ---------------------------------------------------------------------------

/// Latest non-DISMISSED, non-PENDING review state per reviewer. Reviews with
/// a missing author (deleted user, bot) are skipped. Nodes arrive in
/// chronological order, so later entries win.
pub(crate) fn latest_states_by_reviewer(nodes: &[ReviewNode]) -> HashMap<String, String> {
    let mut latest = HashMap::new();
    for node in nodes {
        let Some(author) = &node.author else {
            continue;
        };
        if node.state != "PENDING" && node.state != "DISMISSED" {
            latest.insert(author.login.clone(), node.state.clone());
        }
    }
    latest
}

/// `(approval_count, my_review_status)` for one PR's review nodes.
pub(crate) fn summarize_reviews(nodes: &[ReviewNode], username: &str) -> (i64, String) {
    let latest = latest_states_by_reviewer(nodes);
    let approval_count = latest.values().filter(|s| *s == "APPROVED").count() as i64;
    let my_review_status = latest.get(username).cloned().unwrap_or_default();
    (approval_count, my_review_status)
}

/// Map a commit's status-check rollup to the stored CI columns. Failed check
/// names are only reported when the overall state is a failure.
pub(crate) fn rollup_to_ci(rollup: Option<&StatusCheckRollup>) -> (String, Vec<String>) {
    let Some(rollup) = rollup else {
        return ("unknown".to_string(), Vec::new());
    };
    let state = match rollup.state.as_str() {
        "SUCCESS" => "success",
        "FAILURE" | "ERROR" => "failure",
        "PENDING" | "EXPECTED" => "pending",
        _ => "unknown",
    };
    if state != "failure" {
        return (state.to_string(), Vec::new());
    }

    let mut failed = Vec::new();
    for context in &rollup.contexts.nodes {
        match (&context.name, &context.conclusion) {
            // Check runs report a conclusion once finished.
            (Some(name), Some(conclusion))
                if matches!(conclusion.as_str(), "FAILURE" | "TIMED_OUT") =>
            {
                failed.push(name.clone());
                continue;
            }
            _ => {}
        }
        // Legacy commit statuses report a state instead.
        if let (Some(name), Some(state)) = (&context.context, &context.state) {
            if matches!(state.as_str(), "FAILURE" | "ERROR") {
                failed.push(name.clone());
            }
        }
    }
    (state.to_string(), failed)
}

fn build_review_data_query(owner: &str, repo: &str, numbers: &[u64]) -> String {
    let mut query = String::from("query {");
    for (index, number) in numbers.iter().enumerate() {
        query.push_str(&format!(
            r#"
            pr{index}: repository(owner: "{owner}", name: "{repo}") {{
                pullRequest(number: {number}) {{
                    number
                    isDraft
                    reviews(last: {REVIEW_PAGE_SIZE}) {{
                        nodes {{
                            author {{ login }}
                            state
                        }}
                    }}
                    commits(last: 1) {{
                        nodes {{
                            commit {{
                                statusCheckRollup {{
                                    state
                                    contexts(first: 100) {{
                                        nodes {{
                                            __typename
                                            ... on CheckRun {{ name conclusion }}
                                            ... on StatusContext {{ context state }}
                                        }}
                                    }}
                                }}
                            }}
                        }}
                    }}
                }}
            }}"#
        ));
    }
    query.push_str("\n}");
    query
}

fn build_details_query(owner: &str, repo: &str, numbers: &[u64]) -> String {
    let mut query = String::from("query {");
    for (index, number) in numbers.iter().enumerate() {
        query.push_str(&format!(
            r#"
            pr{index}: repository(owner: "{owner}", name: "{repo}") {{
                pullRequest(number: {number}) {{
                    additions
                    deletions
                    changedFiles
                    createdAt
                    isDraft
                    reviews {{ totalCount }}
                    reviewRequests(first: 50) {{
                        nodes {{
                            requestedReviewer {{
                                __typename
                                ... on User {{ login }}
                            }}
                        }}
                    }}
                }}
            }}"#
        ));
    }
    query.push_str("\n}");
    query
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    total_count: i64,
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    number: u64,
    repository_url: String,
    /// Present only when the issue is a pull request.
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    state: String,
    title: Option<String>,
    #[serde(default)]
    draft: bool,
    html_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    user: Option<ApiUser>,
    head: PullRef,
}

#[derive(Debug, Deserialize)]
struct PullRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimitBucket,
}

#[derive(Debug, Deserialize)]
struct RateLimitBucket {
    limit: i64,
    remaining: i64,
    reset: i64,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<HashMap<String, Option<T>>>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

impl<T> GraphQlResponse<T> {
    fn into_data(self) -> Result<HashMap<String, Option<T>>, GitHubError> {
        match self.data {
            Some(data) => Ok(data),
            None => {
                let message = self
                    .errors
                    .unwrap_or_default()
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(GitHubError::Decode(format!(
                    "GraphQL response carried no data: {}",
                    message
                )))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewAlias {
    #[serde(rename = "pullRequest")]
    pull_request: Option<ReviewPrNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewPrNode {
    #[serde(rename = "isDraft", default)]
    is_draft: bool,
    reviews: ReviewConnection,
    #[serde(default)]
    commits: CommitConnection,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct ReviewConnection {
    #[serde(default)]
    pub(crate) nodes: Vec<ReviewNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewNode {
    pub(crate) author: Option<ReviewAuthor>,
    pub(crate) state: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewAuthor {
    pub(crate) login: String,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct CommitConnection {
    #[serde(default)]
    nodes: Vec<CommitEdge>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CommitEdge {
    commit: CommitNode,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CommitNode {
    #[serde(rename = "statusCheckRollup")]
    status_check_rollup: Option<StatusCheckRollup>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusCheckRollup {
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) contexts: RollupContexts,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct RollupContexts {
    #[serde(default)]
    pub(crate) nodes: Vec<RollupContext>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct RollupContext {
    /// CheckRun fields.
    pub(crate) name: Option<String>,
    pub(crate) conclusion: Option<String>,
    /// StatusContext fields.
    pub(crate) context: Option<String>,
    pub(crate) state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DetailsAlias {
    #[serde(rename = "pullRequest")]
    pull_request: Option<DetailsPrNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DetailsPrNode {
    #[serde(default)]
    additions: i64,
    #[serde(default)]
    deletions: i64,
    #[serde(rename = "changedFiles", default)]
    changed_files: i64,
    #[serde(rename = "createdAt")]
    created_at: Option<DateTime<Utc>>,
    #[serde(rename = "isDraft", default)]
    is_draft: bool,
    reviews: ReviewCount,
    #[serde(rename = "reviewRequests", default)]
    review_requests: ReviewRequests,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewCount {
    #[serde(rename = "totalCount", default)]
    total_count: i64,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct ReviewRequests {
    #[serde(default)]
    nodes: Vec<ReviewRequestNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewRequestNode {
    #[serde(rename = "requestedReviewer")]
    requested_reviewer: Option<RequestedReviewer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RequestedReviewer {
    login: Option<String>,
}

// ---------------------------------------------------------------------------
// Offline double for tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    fn review(author: Option<&str>, state: &str) -> ReviewNode {
        ReviewNode {
            author: author.map(|login| ReviewAuthor {
                login: login.to_string(),
            }),
            state: state.to_string(),
        }
    }

    #[test]
    fn test_summarize_reviews_counts_latest_approvals() {
        let nodes = vec![
            review(Some("alice"), "CHANGES_REQUESTED"),
            review(Some("bob"), "APPROVED"),
            review(Some("alice"), "APPROVED"),
        ];
        let (approvals, mine) = summarize_reviews(&nodes, "carol");
        assert_eq!(approvals, 2);
        assert_eq!(mine, "");
    }

    #[test]
    fn test_summarize_reviews_latest_state_wins() {
        let nodes = vec![
            review(Some("alice"), "APPROVED"),
            review(Some("alice"), "CHANGES_REQUESTED"),
        ];
        let (approvals, _) = summarize_reviews(&nodes, "bob");
        assert_eq!(approvals, 0);
    }

    #[test]
    fn test_summarize_reviews_skips_pending_and_dismissed() {
        let nodes = vec![
            review(Some("alice"), "APPROVED"),
            review(Some("alice"), "PENDING"),
            review(Some("bob"), "DISMISSED"),
        ];
        let (approvals, _) = summarize_reviews(&nodes, "carol");
        // PENDING does not displace alice's approval; bob has no live state.
        assert_eq!(approvals, 1);
    }

    #[test]
    fn test_summarize_reviews_skips_missing_authors() {
        let nodes = vec![review(None, "APPROVED"), review(Some("bob"), "COMMENTED")];
        let (approvals, mine) = summarize_reviews(&nodes, "bob");
        assert_eq!(approvals, 0);
        assert_eq!(mine, "COMMENTED");
    }

    #[test]
    fn test_summarize_reviews_my_status() {
        let nodes = vec![
            review(Some("me"), "COMMENTED"),
            review(Some("me"), "CHANGES_REQUESTED"),
        ];
        let (_, mine) = summarize_reviews(&nodes, "me");
        assert_eq!(mine, "CHANGES_REQUESTED");
    }

    #[test]
    fn test_parse_repo_from_url() {
        assert_eq!(
            parse_repo_from_url("https://api.github.com/repos/acme/foo"),
            Some(("acme".to_string(), "foo".to_string()))
        );
        assert_eq!(parse_repo_from_url(""), None);
    }

    #[test]
    fn test_group_by_repo_is_deterministic() {
        let ids = vec![
            PrId::new("zeta", "z", 1),
            PrId::new("acme", "foo", 7),
            PrId::new("acme", "foo", 9),
        ];
        let groups = group_by_repo(ids.iter());
        let keys: Vec<_> = groups.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                ("acme".to_string(), "foo".to_string()),
                ("zeta".to_string(), "z".to_string())
            ]
        );
        assert_eq!(groups[&("acme".to_string(), "foo".to_string())], vec![7, 9]);
    }

    #[test]
    fn test_rollup_to_ci_mapping() {
        assert_eq!(rollup_to_ci(None), ("unknown".to_string(), vec![]));

        let rollup = StatusCheckRollup {
            state: "SUCCESS".to_string(),
            contexts: RollupContexts::default(),
        };
        assert_eq!(rollup_to_ci(Some(&rollup)), ("success".to_string(), vec![]));

        let rollup = StatusCheckRollup {
            state: "PENDING".to_string(),
            contexts: RollupContexts::default(),
        };
        assert_eq!(rollup_to_ci(Some(&rollup)), ("pending".to_string(), vec![]));
    }

    #[test]
    fn test_rollup_to_ci_collects_failed_checks() {
        let rollup = StatusCheckRollup {
            state: "FAILURE".to_string(),
            contexts: RollupContexts {
                nodes: vec![
                    RollupContext {
                        name: Some("build".to_string()),
                        conclusion: Some("FAILURE".to_string()),
                        ..Default::default()
                    },
                    RollupContext {
                        name: Some("lint".to_string()),
                        conclusion: Some("SUCCESS".to_string()),
                        ..Default::default()
                    },
                    RollupContext {
                        context: Some("ci/legacy".to_string()),
                        state: Some("ERROR".to_string()),
                        ..Default::default()
                    },
                ],
            },
        };
        let (state, failed) = rollup_to_ci(Some(&rollup));
        assert_eq!(state, "failure");
        assert_eq!(failed, vec!["build".to_string(), "ci/legacy".to_string()]);
    }

    #[test]
    fn test_review_data_response_parses() {
        let payload = r#"{
            "data": {
                "pr0": {
                    "pullRequest": {
                        "number": 7,
                        "isDraft": false,
                        "reviews": {
                            "nodes": [
                                {"author": {"login": "bob"}, "state": "APPROVED"},
                                {"author": null, "state": "APPROVED"}
                            ]
                        },
                        "commits": {
                            "nodes": [
                                {"commit": {"statusCheckRollup": {"state": "SUCCESS", "contexts": {"nodes": []}}}}
                            ]
                        }
                    }
                }
            }
        }"#;
        let response: GraphQlResponse<ReviewAlias> =
            serde_json::from_str(payload).expect("should parse");
        let data = response.into_data().expect("should have data");
        let pr = data["pr0"]
            .as_ref()
            .unwrap()
            .pull_request
            .as_ref()
            .unwrap();
        let (approvals, mine) = summarize_reviews(&pr.reviews.nodes, "me");
        assert_eq!(approvals, 1);
        assert_eq!(mine, "");
        assert!(!pr.is_draft);
    }

    #[test]
    fn test_graphql_response_without_data_is_an_error() {
        let payload = r#"{"errors": [{"message": "bad credentials"}]}"#;
        let response: GraphQlResponse<ReviewAlias> =
            serde_json::from_str(payload).expect("should parse");
        let err = response.into_data().expect_err("should be error");
        assert!(err.to_string().contains("bad credentials"));
    }

    #[test]
    fn test_details_response_parses() {
        let payload = r#"{
            "data": {
                "pr0": {
                    "pullRequest": {
                        "additions": 1200,
                        "deletions": 40,
                        "changedFiles": 12,
                        "createdAt": "2025-01-01T00:00:00Z",
                        "isDraft": false,
                        "reviews": {"totalCount": 4},
                        "reviewRequests": {
                            "nodes": [
                                {"requestedReviewer": {"__typename": "User", "login": "me"}}
                            ]
                        }
                    }
                }
            }
        }"#;
        let response: GraphQlResponse<DetailsAlias> =
            serde_json::from_str(payload).expect("should parse");
        let data = response.into_data().expect("should have data");
        let pr = data["pr0"]
            .as_ref()
            .unwrap()
            .pull_request
            .as_ref()
            .unwrap();
        assert_eq!(pr.additions, 1200);
        assert_eq!(pr.reviews.total_count, 4);
        assert_eq!(
            pr.review_requests.nodes[0]
                .requested_reviewer
                .as_ref()
                .unwrap()
                .login
                .as_deref(),
            Some("me")
        );
    }

    #[test]
    fn test_build_review_data_query_aliases() {
        let query = build_review_data_query("acme", "foo", &[7, 9]);
        assert!(query.contains("pr0: repository(owner: \"acme\", name: \"foo\")"));
        assert!(query.contains("pullRequest(number: 7)"));
        assert!(query.contains("pr1: repository"));
        assert!(query.contains("pullRequest(number: 9)"));
        assert!(query.contains("reviews(last: 100)"));
    }
}
