use crate::types::{RepoId, TaskPath};
use thiserror::Error;

/// Single taxonomy for everything that can go wrong while driving a task.
/// Each variant maps 1:1 to a row of the error table; callers branch on
/// variant, never on message text.
#[derive(Debug, Error)]
pub enum RalphError {
    #[error("hosting service rate limited token (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("hosting service returned {status} for {endpoint}")]
    HostingHttp { status: u16, endpoint: String },

    #[error("hosting service request timed out: {endpoint}")]
    HostingTimeout { endpoint: String },

    #[error("hosting service response could not be decoded: {0}")]
    HostingDecode(String),

    #[error("store operation failed: {0}")]
    Store(#[from] sqlx::Error),

    #[error("task {task} has conflicting status labels: {labels:?}")]
    ConflictingStatusLabels {
        task: TaskPath,
        labels: Vec<&'static str>,
    },

    #[error("idempotency claim failed for {task}: already claimed with hash {existing_hash}")]
    IdempotencyConflict {
        task: TaskPath,
        existing_hash: String,
    },

    #[error("session runner failed for {task}: {reason}")]
    SessionFailed { task: TaskPath, reason: String },

    #[error("session for {task} exceeded wall-clock budget of {limit_secs}s")]
    SessionTimedOut { task: TaskPath, limit_secs: u64 },

    #[error("merge gate blocked {task}: {reason}")]
    MergeBlocked { task: TaskPath, reason: String },

    #[error("merge retry limit ({limit}) exceeded for {task}")]
    MergeRetryExhausted { task: TaskPath, limit: u32 },

    #[error("repo {repo} is not allowlisted for auto-queue")]
    RepoNotAllowlisted { repo: RepoId },

    #[error("budget exhausted for lane {lane}, resume at {resume_at}")]
    BudgetExhausted {
        lane: String,
        resume_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("daemon registry entry for {daemon} is stale")]
    StaleDaemon { daemon: String },

    #[error("worktree setup failed for {task}: {reason}")]
    WorktreeSetup { task: TaskPath, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("stale ownership: {task} is held by {holder}")]
    StaleOwnership { task: TaskPath, holder: String },

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RalphError {
    /// Errors the worker should treat as transient and retry with backoff,
    /// as opposed to terminal failures that should escalate immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RalphError::RateLimited { .. }
                | RalphError::HostingTimeout { .. }
                | RalphError::BudgetExhausted { .. }
                | RalphError::HostingHttp { status: 500..=599, .. }
        )
    }
}

pub type RalphResult<T> = Result<T, RalphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_retryable() {
        let e = RalphError::RateLimited { retry_after_secs: 30 };
        assert!(e.is_retryable());
    }

    #[test]
    fn merge_blocked_is_not_retryable() {
        let e = RalphError::MergeBlocked {
            task: TaskPath("github:acme/widgets#1".into()),
            reason: "dirty".into(),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn server_error_is_retryable() {
        let e = RalphError::HostingHttp {
            status: 503,
            endpoint: "/repos".into(),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn client_error_is_not_retryable() {
        let e = RalphError::HostingHttp {
            status: 404,
            endpoint: "/repos".into(),
        };
        assert!(!e.is_retryable());
    }
}
