use crate::clock::Clock;
use crate::events::RalphEvent;
use crate::hosting::{HostingClient, IssueMutation};
use crate::label_io::{execute_label_ops, plan_label_ops, LabelIoOutcome, TransientCooldowns};
use crate::relationship::{decide, BlockDecision, Coverage, DependencySignal};
use crate::store::Store;
use crate::types::{
    BlockedSource, DaemonId, IssueOpenState, IssueSnapshot, Priority, RalphStatusLabel, RepoConfig,
    RepoId, TaskOpState, TaskPath, TaskStatus, TaskView,
};
use chrono::Duration as ChronoDuration;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct ClaimRejection {
    pub reason: String,
    pub blocked_source: Option<BlockedSource>,
}

pub enum ClaimResult {
    Claimed(TaskView),
    Blocked(ClaimRejection),
    /// C5 could not decide; proceed without gating, but the caller must
    /// not churn the blocked/queued label (spec.md §4.6).
    ProceedUnknown(TaskView),
}

/// Total status→label mapping. `escalated`/`stuck` never map back
/// automatically — they require operator action (spec.md §4.6).
pub fn status_to_label(status: TaskStatus) -> Option<RalphStatusLabel> {
    match status {
        TaskStatus::Queued => Some(RalphStatusLabel::Queued),
        TaskStatus::Starting | TaskStatus::InProgress => Some(RalphStatusLabel::InProgress),
        TaskStatus::Blocked => Some(RalphStatusLabel::Blocked),
        TaskStatus::Throttled => Some(RalphStatusLabel::Throttled),
        TaskStatus::Escalated => Some(RalphStatusLabel::Escalated),
        TaskStatus::Done => Some(RalphStatusLabel::Done),
    }
}

pub fn label_to_status(label: RalphStatusLabel, open: &IssueOpenState) -> TaskStatus {
    match (label, open) {
        (RalphStatusLabel::Queued, _) => TaskStatus::Queued,
        (RalphStatusLabel::InProgress, _) => TaskStatus::InProgress,
        (RalphStatusLabel::InBot, _) => TaskStatus::InProgress,
        (RalphStatusLabel::Blocked, _) => TaskStatus::Blocked,
        (RalphStatusLabel::Paused, _) => TaskStatus::Blocked,
        (RalphStatusLabel::Throttled, _) => TaskStatus::Throttled,
        (RalphStatusLabel::Escalated, _) => TaskStatus::Escalated,
        (RalphStatusLabel::Stuck, _) => TaskStatus::Escalated,
        (RalphStatusLabel::Done, _) => TaskStatus::Done,
    }
}

pub struct QueueDriver {
    store: Arc<dyn Store>,
    hosting: Arc<dyn HostingClient>,
    clock: Arc<dyn Clock>,
    cooldowns: TransientCooldowns,
}

impl QueueDriver {
    pub fn new(store: Arc<dyn Store>, hosting: Arc<dyn HostingClient>, clock: Arc<dyn Clock>) -> Self {
        Self { store, hosting, clock, cooldowns: TransientCooldowns::new() }
    }

    pub async fn list_queued(&self, repo: &RepoId) -> anyhow::Result<Vec<TaskView>> {
        let snapshots = self.store.list_issue_snapshots(repo).await?;
        let mut out = Vec::new();
        for snap in snapshots {
            if let Ok(Some(RalphStatusLabel::Queued)) = snap.status_label() {
                out.push(self.derive_task_view(&snap).await?);
            }
        }
        Ok(out)
    }

    pub async fn list_by_status(&self, repo: &RepoId, status: TaskStatus) -> anyhow::Result<Vec<TaskView>> {
        let snapshots = self.store.list_issue_snapshots(repo).await?;
        let mut out = Vec::new();
        for snap in snapshots {
            let view = self.derive_task_view(&snap).await?;
            if view.status == status {
                out.push(view);
            }
        }
        Ok(out)
    }

    async fn derive_task_view(&self, snapshot: &IssueSnapshot) -> anyhow::Result<TaskView> {
        let path = TaskPath::new(&snapshot.repo, snapshot.number);
        let op_state = self.store.load_op_state(&path).await?;
        let status = match snapshot.status_label() {
            Ok(Some(label)) => label_to_status(label, &snapshot.open_state),
            Ok(None) => TaskStatus::Queued,
            Err(_) => TaskStatus::Queued,
        };
        Ok(TaskView {
            path,
            repo: snapshot.repo.clone(),
            number: snapshot.number,
            status,
            priority: Priority::P2,
            session_id: op_state.as_ref().and_then(|s| s.session_id.clone()),
            worktree: op_state.as_ref().and_then(|s| s.worktree.clone()),
            worker_id: op_state.as_ref().and_then(|s| s.worker_id.clone()),
            slot: op_state.as_ref().and_then(|s| s.slot),
            daemon_id: op_state.as_ref().map(|s| s.daemon_id.clone()),
            heartbeat_at: op_state.as_ref().map(|s| s.heartbeat_at),
            blocked_source: None,
            blocked_reason: None,
            author: snapshot.author.clone(),
            issue_open: snapshot.open_state == IssueOpenState::Open,
        })
    }

    /// Re-reads live labels (snapshots may be stale); gates on C5 when
    /// queued; claims via label transition then op-state upsert — the
    /// op-state upsert is the authoritative "I own this task now" step
    /// (spec.md §4.6).
    pub async fn try_claim(
        &self,
        repo: &RepoId,
        number: u64,
        daemon_id: &DaemonId,
        worker_id: &str,
        slot: u32,
        signals: &[DependencySignal],
        coverage: &Coverage,
        config: &RepoConfig,
    ) -> anyhow::Result<ClaimResult> {
        let live = self.hosting.fetch_issue(repo, number).await?;
        self.store.save_issue_snapshot(&live).await?;

        let current_label = live.status_label();
        let is_queued = matches!(current_label, Ok(Some(RalphStatusLabel::Queued)));

        if is_queued {
            match decide(signals, coverage) {
                BlockDecision::Blocked => {
                    if config.auto_queue {
                        self.write_status_label(repo, number, &live, RalphStatusLabel::Blocked).await.ok();
                    }
                    return Ok(ClaimResult::Blocked(ClaimRejection {
                        reason: "dependency blocked".into(),
                        blocked_source: Some(BlockedSource::Deps),
                    }));
                }
                BlockDecision::Unknown => {
                    // Proceed without gating; do not churn the label.
                }
                BlockDecision::Runnable => {}
            }
        }

        self.write_status_label(repo, number, &live, RalphStatusLabel::InProgress).await?;

        let now = self.clock.now();
        let path = TaskPath::new(repo, number);
        let next = TaskOpState {
            repo: repo.clone(),
            task_path: path.clone(),
            session_id: None,
            worktree: None,
            worker_id: Some(worker_id.to_string()),
            slot: Some(slot),
            daemon_id: daemon_id.clone(),
            heartbeat_at: now,
            released_at: None,
            released_reason: None,
        };
        if self.store.compare_and_set_op_state(&path, None, &next).await?.is_err() {
            anyhow::bail!("task {} already owned by another daemon", path);
        }
        self.store
            .append_event(
                &RalphEvent::TaskClaimed { task: path.clone(), daemon_id: daemon_id.clone(), worker_id: worker_id.to_string(), slot },
                now,
            )
            .await?;

        let view = self.derive_task_view(&live).await?;
        if matches!(decide(signals, coverage), BlockDecision::Unknown) {
            Ok(ClaimResult::ProceedUnknown(view))
        } else {
            Ok(ClaimResult::Claimed(view))
        }
    }

    /// Compare-and-set op-state heartbeat; returns `false` if another
    /// daemon owns the task.
    pub async fn heartbeat(&self, task: &TaskPath, daemon_id: &DaemonId) -> anyhow::Result<bool> {
        let current = self.store.load_op_state(task).await?;
        match &current {
            Some(state) if &state.daemon_id == daemon_id => {
                let now = self.clock.now();
                let next = TaskOpState { heartbeat_at: now, ..state.clone() };
                let result = self.store.compare_and_set_op_state(task, current.as_ref(), &next).await?;
                Ok(result.is_ok())
            }
            _ => Ok(false),
        }
    }

    async fn write_status_label(
        &self,
        repo: &RepoId,
        number: u64,
        snapshot: &IssueSnapshot,
        target: RalphStatusLabel,
    ) -> anyhow::Result<LabelIoOutcome> {
        let mut add = BTreeSet::new();
        add.insert(target.as_str().to_string());
        let mut remove: BTreeSet<String> = RalphStatusLabel::all()
            .iter()
            .filter(|l| **l != target)
            .map(|l| l.as_str().to_string())
            .collect();
        remove.retain(|l| snapshot.labels.contains(l));

        let (to_add, to_remove) = plan_label_ops(&snapshot.labels, &add, &remove, false)?;
        Ok(execute_label_ops(self.hosting.as_ref(), &self.cooldowns, repo, number, to_add, to_remove).await)
    }

    /// Closed-issue sweep: release op-state and strip labels if no open
    /// PR is tracked; reopen and requeue if a tracked PR is still open.
    pub async fn sweep_closed_issues(&self, repo: &RepoId) -> anyhow::Result<u32> {
        let mut swept = 0u32;
        for snapshot in self.store.list_issue_snapshots(repo).await? {
            if snapshot.open_state != IssueOpenState::Closed {
                continue;
            }
            let path = TaskPath::new(repo, snapshot.number);
            if let Some(pr) = self.store.load_pr_snapshot_for_task(&path).await? {
                if pr.state == crate::types::PrState::Open {
                    let add = IssueMutation { add_labels: vec!["ralph:status:queued".into()], remove_labels: vec![] };
                    self.hosting.mutate_issue_labels(repo, snapshot.number, &add).await.ok();
                    swept += 1;
                    continue;
                }
            }
            self.store
                .release_op_state(&path, "issue closed", self.clock.now())
                .await?;
            swept += 1;
        }
        Ok(swept)
    }

    /// Stale-in-progress sweep: in-progress op-state whose heartbeat
    /// exceeded `ttl` is released and relabelled queued.
    pub async fn sweep_stale_in_progress(&self, repo: &RepoId, ttl: ChronoDuration) -> anyhow::Result<u32> {
        let mut swept = 0u32;
        let now = self.clock.now();
        for state in self.store.list_op_states(repo).await? {
            if state.released_at.is_some() {
                continue;
            }
            if state.is_stale(now, ttl) {
                self.store
                    .release_op_state(&state.task_path, "stale heartbeat", now)
                    .await?;
                let mutation = IssueMutation {
                    add_labels: vec!["ralph:status:queued".into()],
                    remove_labels: vec!["ralph:status:in-progress".into()],
                };
                self.hosting.mutate_issue_labels(repo, state.repo_number(), &mutation).await.ok();
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Blocked-label reconcile for queued issues under an auto-queue
    /// repo: `unknown` never churns the label (spec.md §8 invariant 7).
    pub async fn sweep_blocked_reconcile(
        &self,
        repo: &RepoId,
        config: &RepoConfig,
        signals_for: impl Fn(u64) -> (Vec<DependencySignal>, Coverage),
    ) -> anyhow::Result<u32> {
        if !config.auto_queue {
            return Ok(0);
        }
        let mut touched = 0u32;
        for snapshot in self.store.list_issue_snapshots(repo).await? {
            let label = match snapshot.status_label() {
                Ok(Some(l)) => l,
                _ => continue,
            };
            if label != RalphStatusLabel::Queued && label != RalphStatusLabel::Blocked {
                continue;
            }
            let (signals, coverage) = signals_for(snapshot.number);
            match decide(&signals, &coverage) {
                BlockDecision::Unknown => continue,
                BlockDecision::Blocked if label != RalphStatusLabel::Blocked => {
                    self.write_status_label(repo, snapshot.number, &snapshot, RalphStatusLabel::Blocked).await.ok();
                    touched += 1;
                }
                BlockDecision::Runnable if label != RalphStatusLabel::Queued => {
                    self.write_status_label(repo, snapshot.number, &snapshot, RalphStatusLabel::Queued).await.ok();
                    touched += 1;
                }
                _ => {}
            }
        }
        Ok(touched)
    }
}

impl TaskOpState {
    fn repo_number(&self) -> u64 {
        self.task_path
            .0
            .rsplit('#')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}
