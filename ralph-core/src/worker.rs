use crate::clock::Clock;
use crate::control::ControlPlane;
use crate::escalation::EscalationWriteback;
use crate::events::RalphEvent;
use crate::governor::{BudgetGovernor, Cost, Decision, Lane};
use crate::hosting::HostingClient;
use crate::label_io::{execute_label_ops, plan_label_ops, LabelIoOutcome, TransientCooldowns};
use crate::merge_gate::{GateOutcome, MergeGate};
use crate::notify::{Notification, Notifier, Severity};
use crate::session::{BuildResult, PlanDecision, SessionRunner};
use crate::store::Store;
use crate::types::{
    DaemonId, EscalationType, RalphStatusLabel, RepoConfig, RepoId, TaskOpState, TaskOutcome, TaskPath,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreflightFailure {
    OwnerNotAllowlisted,
    ProfileUnresolvable,
    IssueClosed,
    Throttled,
    Draining,
    WorktreeMissingArtifacts,
}

/// One logical worker per `(repo, slot)` (spec.md §4.7). Every suspension
/// point races against `shutdown` so a drain/process-exit can interrupt
/// cleanly at the next checkpoint rather than blocking it.
pub struct LifecycleWorker {
    pub slot: u32,
    pub daemon_id: DaemonId,
    store: Arc<dyn Store>,
    sessions: Arc<dyn SessionRunner>,
    governor: Arc<BudgetGovernor>,
    control: Arc<ControlPlane>,
    merge_gate: Arc<MergeGate>,
    escalation: Arc<EscalationWriteback>,
    clock: Arc<dyn Clock>,
    hosting: Arc<dyn HostingClient>,
    cooldowns: Arc<TransientCooldowns>,
    notifier: Arc<dyn Notifier>,
}

impl LifecycleWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: u32,
        daemon_id: DaemonId,
        store: Arc<dyn Store>,
        sessions: Arc<dyn SessionRunner>,
        governor: Arc<BudgetGovernor>,
        control: Arc<ControlPlane>,
        merge_gate: Arc<MergeGate>,
        escalation: Arc<EscalationWriteback>,
        clock: Arc<dyn Clock>,
        hosting: Arc<dyn HostingClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            slot,
            daemon_id,
            store,
            sessions,
            governor,
            control,
            merge_gate,
            escalation,
            clock,
            hosting,
            cooldowns: Arc::new(TransientCooldowns::new()),
            notifier,
        }
    }

    /// Flips the issue's status label to `target`, clearing every other
    /// `RalphStatusLabel` present, re-reading the live label set first so
    /// the add/remove plan never fights a concurrent mutation (mirrors
    /// `QueueDriver::write_status_label`, spec.md §4.7 state diagram).
    async fn set_status_label(&self, repo: &RepoId, number: u64, target: RalphStatusLabel) -> anyhow::Result<LabelIoOutcome> {
        let snapshot = self.hosting.fetch_issue(repo, number).await?;
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

    /// Flips the status label and, on anything short of `Ok`, raises a
    /// user-visible notification carrying the classified outcome so a
    /// stuck label doesn't fail silently.
    async fn set_status_label_or_notify(&self, repo: &RepoId, number: u64, task: &TaskPath, target: RalphStatusLabel) {
        match self.set_status_label(repo, number, target).await {
            Ok(LabelIoOutcome::Ok) => {}
            Ok(outcome) => {
                warn!(task = %task, ?outcome, "status label flip did not fully apply");
                self.notifier
                    .send(Notification {
                        task: task.0.clone(),
                        severity: Severity::Warning,
                        message: format!("status label flip to {:?} returned {:?}", target, outcome),
                    })
                    .await
                    .ok();
            }
            Err(e) => {
                warn!(task = %task, error = %e, "status label flip failed");
                self.notifier
                    .send(Notification {
                        task: task.0.clone(),
                        severity: Severity::Warning,
                        message: format!("status label flip to {:?} failed: {e}", target),
                    })
                    .await
                    .ok();
            }
        }
    }

    pub fn preflight(
        &self,
        repo: &RepoId,
        issue_author: &str,
        config: &RepoConfig,
        issue_open: bool,
        worktree_has_plan: bool,
    ) -> Result<(), PreflightFailure> {
        if !config.allowlisted_owners.is_empty() && !config.allowlisted_owners.contains(issue_author) {
            return Err(PreflightFailure::OwnerNotAllowlisted);
        }
        if !issue_open {
            return Err(PreflightFailure::IssueClosed);
        }
        if self.control.is_draining() {
            return Err(PreflightFailure::Draining);
        }
        let decision = self.governor.acquire(repo, &config.token_id, Lane::Important, Cost::Read);
        if matches!(decision, Decision::Defer { .. }) {
            return Err(PreflightFailure::Throttled);
        }
        if !worktree_has_plan {
            return Err(PreflightFailure::WorktreeMissingArtifacts);
        }
        Ok(())
    }

    /// Runs (or resumes) one task from claim through merge, cooperating
    /// with `shutdown` at every suspension point. Pre-flight gates
    /// short-circuit before any agent call (spec.md §4.7).
    #[allow(clippy::too_many_arguments)]
    pub async fn run_task(
        &self,
        repo: &RepoId,
        number: u64,
        task: &TaskPath,
        issue_author: &str,
        issue_open: bool,
        config: &RepoConfig,
        worktree: &str,
        existing_op_state: Option<TaskOpState>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<TaskOutcome> {
        let worktree_has_plan = std::path::Path::new(worktree).join(".ralph/plan.md").exists();
        if let Err(failure) = self.preflight(repo, issue_author, config, issue_open, worktree_has_plan) {
            return Ok(self.reject_preflight(repo, task, failure));
        }

        self.control.checkpoint("routed").await;

        let session_id = match existing_op_state.as_ref().and_then(|s| s.session_id.clone()) {
            Some(id) => {
                self.sessions.resume(&id, worktree).await?;
                id
            }
            None => {
                let id = self.await_or_cancel(self.sessions.open(worktree, &task.0), shutdown).await??;
                self.store
                    .append_event(
                        &RalphEvent::SessionStarted { task: task.clone(), session_id: id.clone(), worktree: worktree.to_string() },
                        self.clock.now(),
                    )
                    .await?;
                id
            }
        };

        let plan_decision = self.run_plan_step(&session_id).await?;
        self.control.checkpoint("planned").await;

        match plan_decision {
            None => {
                self.escalation
                    .escalate(repo, number, task, EscalationType::Other, "plan marker missing after repair attempt", None)
                    .await?;
                return Ok(TaskOutcome::Escalated);
            }
            Some(p) if p.decision == PlanDecision::Escalate || p.confidence < 0.5 => {
                let reason = p.escalation_reason.unwrap_or_else(|| "low confidence".to_string());
                self.escalation.escalate(repo, number, task, EscalationType::LowConfidence, &reason, None).await?;
                return Ok(TaskOutcome::Escalated);
            }
            Some(_) => {}
        }

        let build: BuildResult = self.sessions.build(&session_id).await?;
        if let Some(hard_error) = build.hard_error {
            self.escalation.escalate(repo, number, task, EscalationType::Other, &hard_error, None).await?;
            return Ok(TaskOutcome::Failed);
        }
        let pr_url = match build.pr_url {
            Some(url) => url,
            None => {
                self.escalation
                    .escalate(repo, number, task, EscalationType::Other, "agent did not create a PR", None)
                    .await?;
                return Ok(TaskOutcome::Failed);
            }
        };
        self.store
            .append_event(&RalphEvent::PrOpened { task: task.clone(), pr_url: pr_url.clone() }, self.clock.now())
            .await?;
        self.set_status_label_or_notify(repo, number, task, RalphStatusLabel::InBot).await;
        self.control.checkpoint("pr_ready").await;

        let gate_outcome = self
            .merge_gate
            .run(repo, &pr_url, config, chrono::Duration::zero())
            .await?;

        match gate_outcome {
            GateOutcome::Merged { sha } => {
                self.store
                    .append_event(&RalphEvent::MergeSucceeded { task: task.clone(), pr_url: pr_url.clone(), sha }, self.clock.now())
                    .await?;
                self.set_status_label_or_notify(repo, number, task, RalphStatusLabel::Done).await;
                let _survey = self.sessions.survey(&session_id).await.unwrap_or_default();
                self.sessions.close(&session_id).await.ok();
                Ok(TaskOutcome::Done)
            }
            GateOutcome::Conflict { head_sha } => {
                warn!(task = %task, head_sha, "merge conflict detected");
                self.escalation
                    .escalate(repo, number, task, EscalationType::MergeConflict, "merge conflict", None)
                    .await?;
                Ok(TaskOutcome::Failed)
            }
            GateOutcome::CiFailed { reasons } => {
                let reason = format!("CI failed: {}", reasons.join(", "));
                self.escalation.escalate(repo, number, task, EscalationType::Other, &reason, None).await?;
                Ok(TaskOutcome::Failed)
            }
            GateOutcome::TimedOut { reasons } => {
                let reason = format!("required checks timed out: {}", reasons.join(", "));
                self.escalation.escalate(repo, number, task, EscalationType::Other, &reason, None).await?;
                Ok(TaskOutcome::Failed)
            }
            GateOutcome::Behind => {
                self.escalation
                    .escalate(repo, number, task, EscalationType::Other, "branch behind base, auto-update unavailable", None)
                    .await?;
                Ok(TaskOutcome::Failed)
            }
            GateOutcome::Escalate { reason } => {
                self.escalation.escalate(repo, number, task, EscalationType::Other, &reason, None).await?;
                Ok(TaskOutcome::Failed)
            }
        }
    }

    /// Maps a pre-flight rejection to its deterministic outcome and logs the
    /// classified reason (spec.md §4.7: "each failure produces a
    /// deterministic blocked/throttled/failed outcome").
    fn reject_preflight(&self, repo: &RepoId, task: &TaskPath, failure: PreflightFailure) -> TaskOutcome {
        let (outcome, reason) = match failure {
            PreflightFailure::OwnerNotAllowlisted => (TaskOutcome::Blocked, "issue author not in allowlisted owners"),
            PreflightFailure::ProfileUnresolvable => (TaskOutcome::Blocked, "repo profile unresolvable"),
            PreflightFailure::IssueClosed => (TaskOutcome::Failed, "issue closed before claim"),
            PreflightFailure::Throttled => (TaskOutcome::Throttled, "hard-throttle deferred this task"),
            PreflightFailure::Draining => (TaskOutcome::Throttled, "daemon draining"),
            PreflightFailure::WorktreeMissingArtifacts => (TaskOutcome::Failed, "worktree missing .ralph/plan.md"),
        };
        warn!(repo = %repo.0, task = %task, reason, "pre-flight gate rejected task");
        outcome
    }

    /// Bounded repair: a missing/invalid plan marker gets exactly one
    /// re-ask before the caller treats it as absent (spec.md §4.7).
    async fn run_plan_step(&self, session_id: &str) -> anyhow::Result<Option<crate::session::PlanResult>> {
        if let Some(result) = self.sessions.plan(session_id).await? {
            return Ok(Some(result));
        }
        info!(session_id, "plan marker missing, attempting one repair");
        self.sessions.plan(session_id).await
    }

    /// Races `future` against `shutdown`, returning `Err` if cancelled so
    /// the caller can release ownership with reason `shutdown`.
    async fn await_or_cancel<T>(
        &self,
        future: impl std::future::Future<Output = anyhow::Result<T>>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<anyhow::Result<T>> {
        tokio::select! {
            result = future => Ok(result),
            _ = shutdown.cancelled() => anyhow::bail!("shutdown requested"),
        }
    }
}

/// Resets a task to queued, clearing op-state, when its recorded
/// worktree is missing on resume (spec.md §4.7 "Resume path").
pub fn resume_decision(worktree_exists: bool) -> ResumeDecision {
    if worktree_exists {
        ResumeDecision::Resume
    } else {
        ResumeDecision::ResetToQueued
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeDecision {
    Resume,
    ResetToQueued,
}
