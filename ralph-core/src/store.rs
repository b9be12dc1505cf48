use crate::events::RalphEvent;
use crate::types::{
    Escalation, IdempotencyClaim, IssueSnapshot, ParentVerificationStatus, PrSnapshot, RepoId,
    RuntimeSnapshot, TaskOpState, TaskPath,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence seam for all Ralph state. Every worker, sweeper, and control
/// operation goes through this trait — never touches a connection pool or a
/// `HashMap` directly — so production (SQLite) and test (in-memory) backends
/// are interchangeable.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Issue snapshots ──

    async fn save_issue_snapshot(&self, snapshot: &IssueSnapshot) -> Result<()>;
    async fn load_issue_snapshot(&self, repo: &RepoId, number: u64) -> Result<Option<IssueSnapshot>>;
    /// All known snapshots for a repo, ordered by `number ASC` (determinism
    /// requirement — every listing query is sorted).
    async fn list_issue_snapshots(&self, repo: &RepoId) -> Result<Vec<IssueSnapshot>>;

    // ── Task op-state ──

    async fn load_op_state(&self, task: &TaskPath) -> Result<Option<TaskOpState>>;
    async fn list_op_states(&self, repo: &RepoId) -> Result<Vec<TaskOpState>>;

    /// Compare-and-set on op-state: succeeds only if the stored row matches
    /// `expected` (by daemon id + heartbeat), else returns the current row
    /// so the caller can decide whether to reclaim stale ownership.
    async fn compare_and_set_op_state(
        &self,
        task: &TaskPath,
        expected: Option<&TaskOpState>,
        next: &TaskOpState,
    ) -> Result<Result<(), Option<TaskOpState>>>;

    async fn release_op_state(&self, task: &TaskPath, reason: &str, at: DateTime<Utc>) -> Result<()>;

    // ── PR snapshots ──

    async fn save_pr_snapshot(&self, snapshot: &PrSnapshot) -> Result<()>;
    async fn load_pr_snapshot(&self, url: &str) -> Result<Option<PrSnapshot>>;
    async fn load_pr_snapshot_for_task(&self, task: &TaskPath) -> Result<Option<PrSnapshot>>;

    // ── Idempotency keys ──

    /// Claim `key` with `hash`. Returns `Claimed` on first claim, or
    /// `AlreadyPresent { hash }` with the hash it was originally claimed
    /// with (which may differ from the caller's, a data problem the caller
    /// surfaces rather than silently overwriting).
    async fn claim_idempotency_key(&self, key: &str, hash: &str) -> Result<IdempotencyClaim>;
    async fn idempotency_status(&self, key: &str) -> Result<Option<String>>;

    // ── Parent verification ──

    async fn set_parent_verification(
        &self,
        task: &TaskPath,
        status: ParentVerificationStatus,
    ) -> Result<()>;
    async fn get_parent_verification(&self, task: &TaskPath) -> Result<Option<ParentVerificationStatus>>;

    // ── Escalation markers ──

    async fn save_escalation(&self, task: &TaskPath, escalation: &Escalation) -> Result<()>;
    async fn load_escalation(&self, task: &TaskPath) -> Result<Option<Escalation>>;

    // ── Runtime snapshots (governor summaries, etc.) ──

    async fn save_runtime_snapshot(&self, snapshot: &RuntimeSnapshot) -> Result<()>;
    async fn load_runtime_snapshot(&self, daemon_id: &str) -> Result<Option<RuntimeSnapshot>>;

    // ── Event log (append-only) ──

    async fn append_event(&self, event: &RalphEvent, at: DateTime<Utc>) -> Result<u64>;
    async fn read_events(&self, from_seq: u64, limit: usize) -> Result<Vec<(u64, DateTime<Utc>, RalphEvent)>>;
}
