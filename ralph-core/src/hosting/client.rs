use super::rate_limit::{parse_rate_limit_reset, RateLimitCooldowns};
use crate::errors::{RalphError, RalphResult};
use crate::types::{
    CheckState, IssueSnapshot, MergeStateStatus, PrSnapshot, RepoId, RequiredCheck, TokenId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Response classification, pure over `(status, headers, body)` so it is
/// unit-testable without a live server (spec.md §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Ok,
    RateLimit,
    Auth,
    NotFound,
    Conflict,
    Transient,
    Unknown,
}

pub fn classify_status(status: u16, body: &str) -> Classification {
    match status {
        200..=299 => Classification::Ok,
        401 | 403 => {
            let lower = body.to_lowercase();
            if lower.contains("secondary rate limit")
                || lower.contains("you have exceeded")
                || lower.contains("api rate limit exceeded")
            {
                Classification::RateLimit
            } else {
                Classification::Auth
            }
        }
        404 => Classification::NotFound,
        409 | 412 => Classification::Conflict,
        429 => Classification::RateLimit,
        500..=599 => Classification::Transient,
        _ => Classification::Unknown,
    }
}

#[derive(Clone, Debug)]
pub struct IssueMutation {
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CommentPatch {
    pub comment_id: Option<String>,
    pub body: String,
}

#[derive(Clone, Debug)]
pub struct PrView {
    pub snapshot: PrSnapshot,
    pub checks: Vec<RequiredCheck>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { sha: String },
    HeadNotUpToDate,
    RequiredChecksPending,
    Conflict,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchUpdateOutcome {
    Updated { new_head_sha_known: bool },
    Failed,
}

#[derive(Clone, Debug)]
pub struct MergeRequest {
    pub pr_url: String,
    pub expected_head_sha: String,
}

/// Typed wrapper over the hosting service's REST+GraphQL surface. Every
/// mutating call is idempotent at the caller's discretion — this trait
/// never auto-retries a write.
#[async_trait]
pub trait HostingClient: Send + Sync {
    async fn fetch_issue(&self, repo: &RepoId, number: u64) -> RalphResult<IssueSnapshot>;
    async fn mutate_issue_labels(
        &self,
        repo: &RepoId,
        number: u64,
        mutation: &IssueMutation,
    ) -> RalphResult<()>;
    async fn ensure_label(&self, repo: &RepoId, label: &str) -> RalphResult<()>;
    async fn list_recent_comments(
        &self,
        repo: &RepoId,
        number: u64,
        page_depth: u32,
    ) -> RalphResult<Vec<(String, String)>>;
    async fn upsert_comment(
        &self,
        repo: &RepoId,
        number: u64,
        patch: &CommentPatch,
    ) -> RalphResult<String>;
    async fn fetch_pr(&self, repo: &RepoId, pr_url: &str) -> RalphResult<PrView>;
    async fn update_branch(&self, repo: &RepoId, pr_url: &str) -> RalphResult<BranchUpdateOutcome>;
    async fn merge_pr(&self, repo: &RepoId, request: &MergeRequest) -> RalphResult<MergeOutcome>;
    async fn delete_branch(&self, repo: &RepoId, branch: &str) -> RalphResult<()>;
    async fn graph_dependency_signals(
        &self,
        repo: &RepoId,
        number: u64,
    ) -> RalphResult<Vec<crate::relationship::DependencySignal>>;
}

/// Production `HostingClient` backed by `reqwest`. Emits one `tracing`
/// event per request with the fields spec.md lists; in this crate the
/// event bus *is* the tracing subscriber's JSON output.
pub struct GithubHostingClient {
    http: reqwest::Client,
    base_url: String,
    token_id: TokenId,
    token: String,
    cooldowns: Arc<RateLimitCooldowns>,
}

impl GithubHostingClient {
    pub fn new(base_url: impl Into<String>, token_id: TokenId, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.into(),
            token_id,
            token: token.into(),
            cooldowns: Arc::new(RateLimitCooldowns::new()),
        }
    }

    pub fn cooldowns(&self) -> Arc<RateLimitCooldowns> {
        Arc::clone(&self.cooldowns)
    }

    /// Wait out any standing cooldown for this token, then issue the
    /// request and record a new cooldown if the response classifies as
    /// rate-limited. Never retries the call itself.
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        is_write: bool,
    ) -> RalphResult<(u16, String)> {
        let now = Utc::now();
        let wait = self.cooldowns.wait_duration(&self.token_id, now);
        if wait > chrono::Duration::zero() {
            tokio::time::sleep(wait.to_std().unwrap_or(Duration::ZERO)).await;
        }

        let url = format!("{}{}", self.base_url, path);
        let started = std::time::Instant::now();
        let mut req = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.token);
        if let Some(b) = &body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RalphError::HostingTimeout { endpoint: path.to_string() }
            } else {
                RalphError::HostingDecode(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let reset_header = resp
            .headers()
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let request_id = resp
            .headers()
            .get("x-github-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = resp.text().await.unwrap_or_default();
        let duration = started.elapsed();

        let classification = classify_status(status, &text);
        let rate_limited = classification == Classification::RateLimit;
        if rate_limited {
            if let Some(resume_at) = parse_rate_limit_reset(reset_header.as_deref(), &text, now) {
                self.cooldowns.record(&self.token_id, resume_at);
            }
        }

        info!(
            method = %method,
            path,
            status,
            duration_ms = duration.as_millis() as u64,
            request_id,
            write = is_write,
            rate_limited,
            "hosting_request"
        );

        match classification {
            Classification::Ok => Ok((status, text)),
            Classification::RateLimit => Err(RalphError::RateLimited {
                retry_after_secs: self
                    .cooldowns
                    .wait_duration(&self.token_id, now)
                    .num_seconds()
                    .max(0) as u64,
            }),
            Classification::NotFound => Ok((status, text)),
            Classification::Auth | Classification::Conflict | Classification::Transient | Classification::Unknown => {
                warn!(status, path, "hosting_request_failed");
                Err(RalphError::HostingHttp {
                    status,
                    endpoint: path.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl HostingClient for GithubHostingClient {
    async fn fetch_issue(&self, repo: &RepoId, number: u64) -> RalphResult<IssueSnapshot> {
        let path = format!("/repos/{}/issues/{}", repo.0, number);
        let (_, body) = self.send(reqwest::Method::GET, &path, None, false).await?;
        let parsed: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| RalphError::HostingDecode(e.to_string()))?;
        issue_snapshot_from_json(repo, &parsed)
    }

    async fn mutate_issue_labels(
        &self,
        repo: &RepoId,
        number: u64,
        mutation: &IssueMutation,
    ) -> RalphResult<()> {
        if !mutation.add_labels.is_empty() {
            let path = format!("/repos/{}/issues/{}/labels", repo.0, number);
            self.send(
                reqwest::Method::POST,
                &path,
                Some(serde_json::json!({ "labels": mutation.add_labels })),
                true,
            )
            .await?;
        }
        for label in &mutation.remove_labels {
            let path = format!("/repos/{}/issues/{}/labels/{}", repo.0, number, label);
            self.send(reqwest::Method::DELETE, &path, None, true).await?;
        }
        Ok(())
    }

    async fn ensure_label(&self, repo: &RepoId, label: &str) -> RalphResult<()> {
        let path = format!("/repos/{}/labels", repo.0);
        self.send(
            reqwest::Method::POST,
            &path,
            Some(serde_json::json!({ "name": label, "color": "ededed" })),
            true,
        )
        .await?;
        Ok(())
    }

    async fn list_recent_comments(
        &self,
        repo: &RepoId,
        number: u64,
        page_depth: u32,
    ) -> RalphResult<Vec<(String, String)>> {
        let path = format!(
            "/repos/{}/issues/{}/comments?per_page=100&page={}",
            repo.0, number, page_depth
        );
        let (_, body) = self.send(reqwest::Method::GET, &path, None, false).await?;
        let raw: Vec<serde_json::Value> =
            serde_json::from_str(&body).map_err(|e| RalphError::HostingDecode(e.to_string()))?;
        Ok(raw
            .into_iter()
            .filter_map(|v| {
                let id = v.get("id")?.to_string();
                let text = v.get("body")?.as_str()?.to_string();
                Some((id, text))
            })
            .collect())
    }

    async fn upsert_comment(
        &self,
        repo: &RepoId,
        number: u64,
        patch: &CommentPatch,
    ) -> RalphResult<String> {
        match &patch.comment_id {
            Some(id) => {
                let path = format!("/repos/{}/issues/comments/{}", repo.0, id);
                self.send(
                    reqwest::Method::PATCH,
                    &path,
                    Some(serde_json::json!({ "body": patch.body })),
                    true,
                )
                .await?;
                Ok(id.clone())
            }
            None => {
                let path = format!("/repos/{}/issues/{}/comments", repo.0, number);
                let (_, body) = self
                    .send(
                        reqwest::Method::POST,
                        &path,
                        Some(serde_json::json!({ "body": patch.body })),
                        true,
                    )
                    .await?;
                let parsed: serde_json::Value =
                    serde_json::from_str(&body).map_err(|e| RalphError::HostingDecode(e.to_string()))?;
                Ok(parsed.get("id").map(|v| v.to_string()).unwrap_or_default())
            }
        }
    }

    async fn fetch_pr(&self, repo: &RepoId, pr_url: &str) -> RalphResult<PrView> {
        let path = format!("/repos/{}/pulls/{}", repo.0, pr_number_from_url(pr_url));
        let (_, body) = self.send(reqwest::Method::GET, &path, None, false).await?;
        let parsed: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| RalphError::HostingDecode(e.to_string()))?;
        let snapshot = pr_snapshot_from_json(repo, pr_url, &parsed)?;
        let checks = self.fetch_check_runs(repo, &snapshot.head_sha).await?;
        Ok(PrView { snapshot, checks })
    }

    async fn update_branch(&self, repo: &RepoId, pr_url: &str) -> RalphResult<BranchUpdateOutcome> {
        let path = format!(
            "/repos/{}/pulls/{}/update-branch",
            repo.0,
            pr_number_from_url(pr_url)
        );
        match self.send(reqwest::Method::PUT, &path, None, true).await {
            Ok(_) => Ok(BranchUpdateOutcome::Updated { new_head_sha_known: false }),
            Err(_) => Ok(BranchUpdateOutcome::Failed),
        }
    }

    async fn merge_pr(&self, repo: &RepoId, request: &MergeRequest) -> RalphResult<MergeOutcome> {
        let path = format!(
            "/repos/{}/pulls/{}/merge",
            repo.0,
            pr_number_from_url(&request.pr_url)
        );
        let result = self
            .send(
                reqwest::Method::PUT,
                &path,
                Some(serde_json::json!({ "sha": request.expected_head_sha })),
                true,
            )
            .await;
        match result {
            Ok((_, body)) => {
                let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
                let sha = parsed
                    .get("sha")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&request.expected_head_sha)
                    .to_string();
                Ok(MergeOutcome::Merged { sha })
            }
            Err(RalphError::HostingHttp { status: 405, .. }) => Ok(MergeOutcome::Conflict),
            Err(RalphError::HostingHttp { status: 409, .. }) => {
                Ok(MergeOutcome::HeadNotUpToDate)
            }
            Err(_) => Ok(MergeOutcome::Failed),
        }
    }

    async fn graph_dependency_signals(
        &self,
        repo: &RepoId,
        number: u64,
    ) -> RalphResult<Vec<crate::relationship::DependencySignal>> {
        let query = serde_json::json!({
            "query": "query($owner:String!,$name:String!,$number:Int!){repository(owner:$owner,name:$name){issue(number:$number){trackedIssues(first:50){nodes{number state}} trackedInIssues(first:50){nodes{number state}}}}}",
            "variables": { "owner": repo.0.split('/').next().unwrap_or(""), "name": repo.0.split('/').nth(1).unwrap_or(""), "number": number },
        });
        let (_, body) = self.send(reqwest::Method::POST, "/graphql", Some(query), false).await?;
        let parsed: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| RalphError::HostingDecode(e.to_string()))?;
        Ok(crate::relationship::parse_graph_signals(&parsed))
    }

    async fn delete_branch(&self, repo: &RepoId, branch: &str) -> RalphResult<()> {
        let path = format!("/repos/{}/git/refs/heads/{}", repo.0, branch);
        let _ = self.send(reqwest::Method::DELETE, &path, None, true).await;
        Ok(())
    }
}

impl GithubHostingClient {
    /// Fetches the check-runs for a commit and maps GitHub's
    /// `status`/`conclusion` pair onto `CheckState` (spec.md §4.8).
    async fn fetch_check_runs(&self, repo: &RepoId, head_sha: &str) -> RalphResult<Vec<RequiredCheck>> {
        if head_sha.is_empty() {
            return Ok(Vec::new());
        }
        let path = format!("/repos/{}/commits/{}/check-runs", repo.0, head_sha);
        let (_, body) = self.send(reqwest::Method::GET, &path, None, false).await?;
        let parsed: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| RalphError::HostingDecode(e.to_string()))?;
        let runs = parsed.get("check_runs").and_then(|r| r.as_array()).cloned().unwrap_or_default();
        Ok(runs
            .iter()
            .filter_map(|r| {
                let name = r.get("name").and_then(|n| n.as_str())?.to_string();
                let status = r.get("status").and_then(|s| s.as_str()).unwrap_or("queued");
                let conclusion = r.get("conclusion").and_then(|c| c.as_str());
                let state = match (status, conclusion) {
                    ("completed", Some("success")) | ("completed", Some("neutral")) | ("completed", Some("skipped")) => {
                        CheckState::Success
                    }
                    ("completed", _) => CheckState::Failure,
                    _ => CheckState::Pending,
                };
                Some(RequiredCheck { name, state })
            })
            .collect())
    }
}

fn issue_snapshot_from_json(repo: &RepoId, v: &serde_json::Value) -> RalphResult<IssueSnapshot> {
    use crate::types::IssueOpenState;
    use std::collections::BTreeSet;

    let number = v.get("number").and_then(|n| n.as_u64()).unwrap_or(0);
    let open_state = match v.get("state").and_then(|s| s.as_str()) {
        Some("closed") => IssueOpenState::Closed,
        _ => IssueOpenState::Open,
    };
    let labels: BTreeSet<String> = v
        .get("labels")
        .and_then(|l| l.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|l| l.get("name").and_then(|n| n.as_str()).map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let updated_at = v
        .get("updated_at")
        .and_then(|s| s.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(IssueSnapshot {
        repo: repo.clone(),
        number,
        node_id: v.get("node_id").and_then(|s| s.as_str()).unwrap_or_default().to_string(),
        title: v.get("title").and_then(|s| s.as_str()).unwrap_or_default().to_string(),
        open_state,
        labels,
        updated_at,
        author: v
            .get("user")
            .and_then(|u| u.get("login"))
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

fn pr_number_from_url(pr_url: &str) -> String {
    pr_url
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn pr_snapshot_from_json(repo: &RepoId, pr_url: &str, v: &serde_json::Value) -> RalphResult<PrSnapshot> {
    use crate::types::{normalize_pr_url, PrState, TaskPath};
    use std::collections::BTreeSet;

    let state_raw = v.get("state").and_then(|s| s.as_str()).unwrap_or("open");
    let merged = v.get("merged").and_then(|m| m.as_bool()).unwrap_or(false);
    let state = if merged {
        PrState::Merged
    } else if state_raw == "closed" {
        PrState::Closed
    } else {
        PrState::Open
    };

    let mergeable_state = v
        .get("mergeable_state")
        .and_then(|s| s.as_str())
        .unwrap_or("unknown");
    let merge_state = match mergeable_state {
        "clean" => MergeStateStatus::Clean,
        "behind" => MergeStateStatus::Behind,
        "dirty" => MergeStateStatus::Dirty,
        "blocked" => MergeStateStatus::Blocked,
        _ => MergeStateStatus::Unknown,
    };

    let number = v.get("number").and_then(|n| n.as_u64()).unwrap_or(0);
    let labels: BTreeSet<String> = v
        .get("labels")
        .and_then(|l| l.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|l| l.get("name").and_then(|n| n.as_str()).map(String::from))
                .collect()
        })
        .unwrap_or_default();

    Ok(PrSnapshot {
        url: normalize_pr_url(pr_url),
        repo: repo.clone(),
        number,
        task: TaskPath(format!("github:{}#{}", repo.0, number)),
        state,
        head_sha: v
            .get("head")
            .and_then(|h| h.get("sha"))
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
        head_ref: v
            .get("head")
            .and_then(|h| h.get("ref"))
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
        base_ref: v
            .get("base")
            .and_then(|b| b.get("ref"))
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
        merge_state,
        labels,
        author: v
            .get("user")
            .and_then(|u| u.get("login"))
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

/// Aggregate a set of required checks by worst-of `{SUCCESS, PENDING,
/// FAILURE}`, with a missing check counted as pending (spec.md §4.8).
pub fn aggregate_required_checks(required: &[String], checks: &[RequiredCheck]) -> (CheckState, Vec<String>) {
    let mut worst = CheckState::Success;
    let mut reasons = Vec::new();
    let mut sorted_required = required.to_vec();
    sorted_required.sort();

    for name in &sorted_required {
        let state = checks
            .iter()
            .find(|c| &c.name == name)
            .map(|c| c.state)
            .unwrap_or(CheckState::Missing);

        let rank = |s: CheckState| match s {
            CheckState::Success => 0,
            CheckState::Pending | CheckState::Missing => 1,
            CheckState::Failure => 2,
        };
        if rank(state) > rank(worst) {
            worst = state;
        }
        if !matches!(state, CheckState::Success) {
            reasons.push(format!("{name}={state:?}"));
        }
    }
    (worst, reasons)
}
