use crate::clock::Clock;
use crate::hosting::{aggregate_required_checks, BranchUpdateOutcome, HostingClient, MergeOutcome, MergeRequest};
use crate::types::{CheckState, MergeStateStatus, RepoConfig, RequiredCheck};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    Merged { sha: String },
    Conflict { head_sha: String },
    CiFailed { reasons: Vec<String> },
    TimedOut { reasons: Vec<String> },
    Behind,
    Escalate { reason: String },
}

/// Required-check waiter, behind-branch updater, conflict detection, and
/// bounded merge retry (spec.md §4.8).
pub struct MergeGate {
    hosting: Arc<dyn HostingClient>,
    clock: Arc<dyn Clock>,
}

impl MergeGate {
    pub fn new(hosting: Arc<dyn HostingClient>, clock: Arc<dyn Clock>) -> Self {
        Self { hosting, clock }
    }

    pub async fn run(&self, repo: &crate::types::RepoId, pr_url: &str, config: &RepoConfig, pr_age: chrono::Duration) -> anyhow::Result<GateOutcome> {
        let mut view = self.hosting.fetch_pr(repo, pr_url).await?;

        if view.snapshot.merge_state == MergeStateStatus::Dirty {
            return Ok(GateOutcome::Conflict { head_sha: view.snapshot.head_sha });
        }

        if view.snapshot.merge_state == MergeStateStatus::Behind
            && config.auto_update_enabled
            && gate_label_present(config, &view.snapshot.labels)
            && pr_age >= chrono::Duration::minutes(config.auto_update_min_minutes)
        {
            match self.hosting.update_branch(repo, pr_url).await? {
                BranchUpdateOutcome::Updated { .. } => {
                    view = self.hosting.fetch_pr(repo, pr_url).await?;
                }
                BranchUpdateOutcome::Failed => {
                    return Ok(GateOutcome::Escalate { reason: "auto-update-failed".into() });
                }
            }
        }

        let timeout = Duration::from_secs(config.required_check_timeout_secs);
        let poll_interval = Duration::from_secs(config.merge_poll_interval_secs);
        let started = std::time::Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if view.snapshot.merge_state == MergeStateStatus::Dirty {
                return Ok(GateOutcome::Conflict { head_sha: view.snapshot.head_sha });
            }

            let (worst, reasons) = aggregate_required_checks(&config.required_checks, &view.checks);
            match worst {
                CheckState::Success => break,
                CheckState::Failure => return Ok(GateOutcome::CiFailed { reasons }),
                CheckState::Pending | CheckState::Missing => {
                    if started.elapsed() >= timeout {
                        return Ok(GateOutcome::TimedOut { reasons });
                    }
                    let backoff = jittered_backoff(poll_interval, attempt);
                    self.clock.sleep(backoff).await;
                    attempt += 1;
                    view = self.hosting.fetch_pr(repo, pr_url).await?;
                }
            }
        }

        self.merge_with_retry(repo, &view.snapshot.url, &view.snapshot.head_sha, &view.snapshot.head_ref).await
    }

    async fn merge_with_retry(
        &self,
        repo: &crate::types::RepoId,
        pr_url: &str,
        head_sha: &str,
        head_ref: &str,
    ) -> anyhow::Result<GateOutcome> {
        let request = MergeRequest { pr_url: pr_url.to_string(), expected_head_sha: head_sha.to_string() };
        match self.hosting.merge_pr(repo, &request).await? {
            MergeOutcome::Merged { sha } => {
                self.delete_head_branch(repo, head_ref).await;
                Ok(GateOutcome::Merged { sha })
            }
            MergeOutcome::Conflict => Ok(GateOutcome::Conflict { head_sha: head_sha.to_string() }),
            MergeOutcome::HeadNotUpToDate | MergeOutcome::RequiredChecksPending => {
                // One bounded re-attempt: branch-update, re-fetch, merge again.
                match self.hosting.update_branch(repo, pr_url).await? {
                    BranchUpdateOutcome::Updated { .. } => {
                        let view = self.hosting.fetch_pr(repo, pr_url).await?;
                        let retry_request = MergeRequest {
                            pr_url: pr_url.to_string(),
                            expected_head_sha: view.snapshot.head_sha.clone(),
                        };
                        match self.hosting.merge_pr(repo, &retry_request).await? {
                            MergeOutcome::Merged { sha } => {
                                self.delete_head_branch(repo, &view.snapshot.head_ref).await;
                                Ok(GateOutcome::Merged { sha })
                            }
                            _ => Ok(GateOutcome::Escalate { reason: "merge retry exhausted".into() }),
                        }
                    }
                    BranchUpdateOutcome::Failed => Ok(GateOutcome::Escalate { reason: "auto-update-failed".into() }),
                }
            }
            MergeOutcome::Failed => Ok(GateOutcome::Escalate { reason: "merge failed".into() }),
        }
    }

    /// Post-merge branch deletion (spec.md §4.8); best-effort, never fails
    /// the gate outcome if the branch is already gone.
    async fn delete_head_branch(&self, repo: &crate::types::RepoId, head_ref: &str) {
        self.hosting.delete_branch(repo, head_ref).await.ok();
    }
}

fn gate_label_present(config: &RepoConfig, labels: &std::collections::BTreeSet<String>) -> bool {
    match &config.auto_update_label_gate {
        Some(label) => labels.contains(label),
        None => true,
    }
}

/// Bounded exponential backoff shared across all pollers (spec.md §9 open
/// question: "a single shared jittered-backoff helper should be applied
/// uniformly").
pub fn exponential_backoff(base: Duration, attempt: u32) -> Duration {
    let capped_attempt = attempt.min(6);
    let multiplier = 1u64 << capped_attempt;
    base.saturating_mul(multiplier as u32).min(Duration::from_secs(60))
}

/// `exponential_backoff` plus up to 20% random jitter, so concurrent
/// pollers across worker slots don't all wake on the same tick (spec.md
/// §9 open question on a shared jittered-backoff helper).
pub fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    let backoff = exponential_backoff(base, attempt);
    let jitter_fraction = rand::thread_rng().gen_range(0.0..0.2);
    backoff + Duration::from_secs_f64(backoff.as_secs_f64() * jitter_fraction)
}

/// Post-merge CI-debug sub-path: escalate immediately if the head SHA did
/// not advance between attempts (spec.md §4.7, §8 invariant 6).
pub fn ci_debug_step(pre_sha: &str, post_sha: &str) -> CiDebugOutcome {
    if pre_sha == post_sha {
        CiDebugOutcome::NoProgress
    } else {
        CiDebugOutcome::Advanced
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CiDebugOutcome {
    Advanced,
    NoProgress,
}
