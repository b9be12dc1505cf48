use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ─── Scalar identity ───────────────────────────────────────────

/// `owner/name` — unique identifier for a hosting-service repository.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoId(pub String);

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a hosting-service auth token. Backoff and governor state are
/// keyed by this, never by repo — different tokens never inherit each
/// other's cooldown (spec.md §4.2).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(pub String);

/// Stable task identifier — `github:<repo>#<number>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskPath(pub String);

impl TaskPath {
    pub fn new(repo: &RepoId, number: u64) -> Self {
        TaskPath(format!("github:{}#{}", repo.0, number))
    }
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Daemon process identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DaemonId(pub String);

// ─── Repo configuration ────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoConfig {
    pub id: RepoId,
    pub token_id: TokenId,
    pub bot_branch: String,
    pub required_checks: Vec<String>,
    pub auto_update_enabled: bool,
    pub auto_update_min_minutes: i64,
    pub auto_update_label_gate: Option<String>,
    pub auto_queue: bool,
    pub allowlisted_owners: BTreeSet<String>,
    pub max_workers: u32,
    pub ci_fix_attempts: u32,
    pub merge_retry_limit: u32,
    pub required_check_timeout_secs: u64,
    pub merge_poll_interval_secs: u64,
}

// ─── Issue snapshot ────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueOpenState {
    Open,
    Closed,
}

/// Canonical Ralph status labels. At most one may be present on an issue at
/// a time (spec.md §3 invariant); a second one found during polling is a
/// data problem, surfaced rather than silently repaired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RalphStatusLabel {
    Queued,
    InProgress,
    Blocked,
    Paused,
    Throttled,
    InBot,
    Done,
    Stuck,
    Escalated,
}

impl RalphStatusLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RalphStatusLabel::Queued => "ralph:status:queued",
            RalphStatusLabel::InProgress => "ralph:status:in-progress",
            RalphStatusLabel::Blocked => "ralph:status:blocked",
            RalphStatusLabel::Paused => "ralph:status:paused",
            RalphStatusLabel::Throttled => "ralph:status:throttled",
            RalphStatusLabel::InBot => "ralph:status:in-bot",
            RalphStatusLabel::Done => "ralph:status:done",
            RalphStatusLabel::Stuck => "ralph:status:stuck",
            RalphStatusLabel::Escalated => "ralph:escalated",
        }
    }

    pub fn all() -> &'static [RalphStatusLabel] {
        use RalphStatusLabel::*;
        &[
            Queued, InProgress, Blocked, Paused, Throttled, InBot, Done, Stuck, Escalated,
        ]
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::all().iter().copied().find(|l| l.as_str() == label)
    }
}

/// A single-label mutation (add or remove) produced by label planning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOp {
    Add(String),
    Remove(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub repo: RepoId,
    pub number: u64,
    pub node_id: String,
    pub title: String,
    pub open_state: IssueOpenState,
    pub labels: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
    /// Issue opener's login, checked against `RepoConfig::allowlisted_owners`
    /// by the pre-flight gate (spec.md §4.7).
    pub author: String,
}

impl IssueSnapshot {
    /// The single Ralph status label present, if any. `Err` carries every
    /// label found when more than one is present — a violation the caller
    /// logs and surfaces rather than silently reconciling.
    pub fn status_label(&self) -> Result<Option<RalphStatusLabel>, Vec<RalphStatusLabel>> {
        let found: Vec<RalphStatusLabel> = self
            .labels
            .iter()
            .filter_map(|l| RalphStatusLabel::from_label(l))
            .collect();
        match found.len() {
            0 => Ok(None),
            1 => Ok(Some(found[0])),
            _ => Err(found),
        }
    }
}

// ─── Task status / view (derived, never stored) ────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Starting,
    InProgress,
    Blocked,
    Throttled,
    Escalated,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockedSource {
    Deps,
    Allowlist,
    ProfileUnresolvable,
    Other,
}

/// Derived view of a task, assembled from an `IssueSnapshot` plus an
/// optional `TaskOpState` row. Never persisted directly — the worker holds
/// this value, not a back-reference into the queue driver (Design Notes,
/// "cyclic refs").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskView {
    pub path: TaskPath,
    pub repo: RepoId,
    pub number: u64,
    pub status: TaskStatus,
    pub priority: Priority,
    pub session_id: Option<String>,
    pub worktree: Option<String>,
    pub worker_id: Option<String>,
    pub slot: Option<u32>,
    pub daemon_id: Option<DaemonId>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub blocked_source: Option<BlockedSource>,
    pub blocked_reason: Option<String>,
    pub author: String,
    pub issue_open: bool,
}

// ─── Task op-state (persisted local execution metadata) ────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOpState {
    pub repo: RepoId,
    pub task_path: TaskPath,
    pub session_id: Option<String>,
    pub worktree: Option<String>,
    pub worker_id: Option<String>,
    pub slot: Option<u32>,
    pub daemon_id: DaemonId,
    pub heartbeat_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub released_reason: Option<String>,
}

impl TaskOpState {
    /// Ownership is valid iff the daemon id matches and the heartbeat is
    /// within `ttl` of `now` (spec.md §3).
    pub fn is_owned_by(&self, daemon_id: &DaemonId, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.released_at.is_none()
            && &self.daemon_id == daemon_id
            && now - self.heartbeat_at <= ttl
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.released_at.is_none() && now - self.heartbeat_at > ttl
    }
}

// ─── PR snapshot ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

/// The merge-state classifier returned by the hosting service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStateStatus {
    Clean,
    Behind,
    Dirty,
    Blocked,
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrSnapshot {
    pub url: String,
    pub repo: RepoId,
    pub number: u64,
    /// The issue task this PR was opened to resolve. Tracked explicitly
    /// rather than derived, since PR and issue numbers are independent
    /// sequences on the hosting service.
    pub task: TaskPath,
    pub state: PrState,
    pub head_sha: String,
    pub head_ref: String,
    pub base_ref: String,
    pub merge_state: MergeStateStatus,
    pub labels: BTreeSet<String>,
    pub author: String,
}

/// Normalise a PR url: lowercase host, strip trailing slash (spec.md §6).
pub fn normalize_pr_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    match trimmed.split_once("://") {
        Some((scheme, rest)) => match rest.split_once('/') {
            Some((host, path)) => format!("{}://{}/{}", scheme, host.to_lowercase(), path),
            None => format!("{}://{}", scheme, rest.to_lowercase()),
        },
        None => trimmed.to_lowercase(),
    }
}

// ─── Required-check evaluation ──────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckState {
    Success,
    Pending,
    Failure,
    Missing,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequiredCheck {
    pub name: String,
    pub state: CheckState,
}

// ─── Idempotency ────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyClaim {
    Claimed,
    AlreadyPresent { hash: String },
}

// ─── Parent verification ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentVerificationStatus {
    Pending,
    Done,
}

// ─── Escalation ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationType {
    ProductGap,
    LowConfidence,
    AmbiguousRequirements,
    Blocked,
    MergeConflict,
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Escalation {
    pub escalation_type: EscalationType,
    pub reason: String,
    pub run_log_path: Option<String>,
}

/// Final outcome every task terminates in exactly one of (spec.md §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Done,
    Failed,
    Escalated,
    Blocked,
    Throttled,
}

// ─── Runtime snapshot ───────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub daemon_id: DaemonId,
    pub written_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_pr_url_lowercases_host_and_strips_slash() {
        assert_eq!(
            normalize_pr_url("https://GitHub.com/acme/widgets/pull/12/"),
            "https://github.com/acme/widgets/pull/12"
        );
        assert_eq!(
            normalize_pr_url("https://github.com/acme/widgets/pull/12"),
            "https://github.com/acme/widgets/pull/12"
        );
    }

    #[test]
    fn status_label_detects_multiple() {
        let snap = IssueSnapshot {
            repo: RepoId("acme/widgets".into()),
            number: 1,
            node_id: "n1".into(),
            title: "t".into(),
            open_state: IssueOpenState::Open,
            labels: BTreeSet::from([
                "ralph:status:queued".to_string(),
                "ralph:status:blocked".to_string(),
            ]),
            updated_at: Utc::now(),
            author: "someone".into(),
        };
        assert!(snap.status_label().is_err());
    }

    #[test]
    fn status_label_none_when_absent() {
        let snap = IssueSnapshot {
            repo: RepoId("acme/widgets".into()),
            number: 1,
            node_id: "n1".into(),
            title: "t".into(),
            open_state: IssueOpenState::Open,
            labels: BTreeSet::from(["bug".to_string()]),
            updated_at: Utc::now(),
            author: "someone".into(),
        };
        assert_eq!(snap.status_label().unwrap(), None);
    }

    #[test]
    fn op_state_ownership_respects_daemon_and_ttl() {
        let now = Utc::now();
        let state = TaskOpState {
            repo: RepoId("acme/widgets".into()),
            task_path: TaskPath("github:acme/widgets#1".into()),
            session_id: None,
            worktree: None,
            worker_id: None,
            slot: None,
            daemon_id: DaemonId("d1".into()),
            heartbeat_at: now - chrono::Duration::seconds(5),
            released_at: None,
            released_reason: None,
        };
        let ttl = chrono::Duration::seconds(30);
        assert!(state.is_owned_by(&DaemonId("d1".into()), now, ttl));
        assert!(!state.is_owned_by(&DaemonId("d2".into()), now, ttl));
        assert!(!state.is_stale(now, ttl));
        assert!(state.is_stale(now + chrono::Duration::seconds(60), ttl));
    }
}
