use crate::types::{DaemonId, EscalationType, RepoId, TaskPath};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable audit trail entries. Every transition the worker makes is
/// recorded here before (or alongside) any label/comment mutation on the
/// hosting side, so a crash mid-transition leaves a readable trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RalphEvent {
    TaskClaimed {
        task: TaskPath,
        daemon_id: DaemonId,
        worker_id: String,
        slot: u32,
    },
    TaskReleased {
        task: TaskPath,
        reason: String,
    },
    SessionStarted {
        task: TaskPath,
        session_id: String,
        worktree: String,
    },
    SessionFinished {
        task: TaskPath,
        session_id: String,
        exit: String,
    },
    LabelsApplied {
        repo: RepoId,
        number: u64,
        added: Vec<String>,
        removed: Vec<String>,
    },
    PrOpened {
        task: TaskPath,
        pr_url: String,
    },
    MergeAttempted {
        task: TaskPath,
        pr_url: String,
        outcome: String,
    },
    MergeSucceeded {
        task: TaskPath,
        pr_url: String,
        sha: String,
    },
    CiFixRetry {
        task: TaskPath,
        attempt: u32,
    },
    AutoUpdateApplied {
        task: TaskPath,
        pr_url: String,
    },
    Escalated {
        task: TaskPath,
        escalation_type: EscalationType,
        reason: String,
    },
    Throttled {
        task: TaskPath,
        lane: String,
        resume_at: DateTime<Utc>,
    },
    Blocked {
        task: TaskPath,
        reason: String,
    },
    RateLimitHit {
        token_id: String,
        retry_after_secs: u64,
    },
    DaemonStarted {
        daemon_id: DaemonId,
    },
    DaemonShuttingDown {
        daemon_id: DaemonId,
        reason: String,
    },
    StaleOwnershipReclaimed {
        task: TaskPath,
        previous_holder: String,
    },
    IncidentCreated {
        task: TaskPath,
        detail: String,
    },
}

impl RalphEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RalphEvent::TaskClaimed { .. } => "task_claimed",
            RalphEvent::TaskReleased { .. } => "task_released",
            RalphEvent::SessionStarted { .. } => "session_started",
            RalphEvent::SessionFinished { .. } => "session_finished",
            RalphEvent::LabelsApplied { .. } => "labels_applied",
            RalphEvent::PrOpened { .. } => "pr_opened",
            RalphEvent::MergeAttempted { .. } => "merge_attempted",
            RalphEvent::MergeSucceeded { .. } => "merge_succeeded",
            RalphEvent::CiFixRetry { .. } => "ci_fix_retry",
            RalphEvent::AutoUpdateApplied { .. } => "auto_update_applied",
            RalphEvent::Escalated { .. } => "escalated",
            RalphEvent::Throttled { .. } => "throttled",
            RalphEvent::Blocked { .. } => "blocked",
            RalphEvent::RateLimitHit { .. } => "rate_limit_hit",
            RalphEvent::DaemonStarted { .. } => "daemon_started",
            RalphEvent::DaemonShuttingDown { .. } => "daemon_shutting_down",
            RalphEvent::StaleOwnershipReclaimed { .. } => "stale_ownership_reclaimed",
            RalphEvent::IncidentCreated { .. } => "incident_created",
        }
    }
}

/// An envelope stamped with sequencing/time metadata, as written to the
/// JSON-lines event log (one file per UTC day under the events directory).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: RalphEvent,
}
