use crate::events::RalphEvent;
use crate::store::Store;
use crate::types::{
    DaemonId, Escalation, IdempotencyClaim, IssueOpenState, IssueSnapshot, MergeStateStatus,
    ParentVerificationStatus, PrSnapshot, PrState, RepoId, RuntimeSnapshot, TaskOpState, TaskPath,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

/// SQLite-backed `Store`. The embedded database lives at
/// `$RALPH_STATE_DB_PATH`; `migrate` runs the embedded migration set at
/// startup before the daemon accepts any task.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run ralph state migrations")?;
        Ok(())
    }
}

fn labels_to_json(labels: &BTreeSet<String>) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string())
}

fn labels_from_json(raw: &str) -> BTreeSet<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn open_state_str(s: &IssueOpenState) -> &'static str {
    match s {
        IssueOpenState::Open => "open",
        IssueOpenState::Closed => "closed",
    }
}

fn open_state_from_str(s: &str) -> Result<IssueOpenState> {
    match s {
        "open" => Ok(IssueOpenState::Open),
        "closed" => Ok(IssueOpenState::Closed),
        other => Err(anyhow!("unknown issue open_state: {other}")),
    }
}

fn pr_state_str(s: &PrState) -> &'static str {
    match s {
        PrState::Open => "open",
        PrState::Merged => "merged",
        PrState::Closed => "closed",
    }
}

fn pr_state_from_str(s: &str) -> Result<PrState> {
    match s {
        "open" => Ok(PrState::Open),
        "merged" => Ok(PrState::Merged),
        "closed" => Ok(PrState::Closed),
        other => Err(anyhow!("unknown pr state: {other}")),
    }
}

fn merge_state_str(s: &MergeStateStatus) -> &'static str {
    match s {
        MergeStateStatus::Clean => "clean",
        MergeStateStatus::Behind => "behind",
        MergeStateStatus::Dirty => "dirty",
        MergeStateStatus::Blocked => "blocked",
        MergeStateStatus::Unknown => "unknown",
    }
}

fn merge_state_from_str(s: &str) -> MergeStateStatus {
    match s {
        "clean" => MergeStateStatus::Clean,
        "behind" => MergeStateStatus::Behind,
        "dirty" => MergeStateStatus::Dirty,
        "blocked" => MergeStateStatus::Blocked,
        _ => MergeStateStatus::Unknown,
    }
}

fn parent_verification_str(s: &ParentVerificationStatus) -> &'static str {
    match s {
        ParentVerificationStatus::Pending => "pending",
        ParentVerificationStatus::Done => "done",
    }
}

fn parent_verification_from_str(s: &str) -> Result<ParentVerificationStatus> {
    match s {
        "pending" => Ok(ParentVerificationStatus::Pending),
        "done" => Ok(ParentVerificationStatus::Done),
        other => Err(anyhow!("unknown parent verification status: {other}")),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_issue_snapshot(&self, snapshot: &IssueSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO issue_snapshots (repo, number, node_id, title, open_state, labels, updated_at, author)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (repo, number) DO UPDATE SET
                node_id = excluded.node_id,
                title = excluded.title,
                open_state = excluded.open_state,
                labels = excluded.labels,
                updated_at = excluded.updated_at,
                author = excluded.author
            "#,
        )
        .bind(&snapshot.repo.0)
        .bind(snapshot.number as i64)
        .bind(&snapshot.node_id)
        .bind(&snapshot.title)
        .bind(open_state_str(&snapshot.open_state))
        .bind(labels_to_json(&snapshot.labels))
        .bind(snapshot.updated_at.to_rfc3339())
        .bind(&snapshot.author)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_issue_snapshot(&self, repo: &RepoId, number: u64) -> Result<Option<IssueSnapshot>> {
        let row = sqlx::query(
            "SELECT repo, number, node_id, title, open_state, labels, updated_at, author
             FROM issue_snapshots WHERE repo = ? AND number = ?",
        )
        .bind(&repo.0)
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_issue_snapshot).transpose()
    }

    async fn list_issue_snapshots(&self, repo: &RepoId) -> Result<Vec<IssueSnapshot>> {
        let rows = sqlx::query(
            "SELECT repo, number, node_id, title, open_state, labels, updated_at, author
             FROM issue_snapshots WHERE repo = ? ORDER BY number ASC",
        )
        .bind(&repo.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_issue_snapshot).collect()
    }

    async fn load_op_state(&self, task: &TaskPath) -> Result<Option<TaskOpState>> {
        let row = sqlx::query(
            "SELECT task_path, repo, session_id, worktree, worker_id, slot, daemon_id,
                    heartbeat_at, released_at, released_reason
             FROM task_op_state WHERE task_path = ?",
        )
        .bind(&task.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_op_state).transpose()
    }

    async fn list_op_states(&self, repo: &RepoId) -> Result<Vec<TaskOpState>> {
        let rows = sqlx::query(
            "SELECT task_path, repo, session_id, worktree, worker_id, slot, daemon_id,
                    heartbeat_at, released_at, released_reason
             FROM task_op_state WHERE repo = ? ORDER BY task_path ASC",
        )
        .bind(&repo.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_op_state).collect()
    }

    async fn compare_and_set_op_state(
        &self,
        task: &TaskPath,
        expected: Option<&TaskOpState>,
        next: &TaskOpState,
    ) -> Result<Result<(), Option<TaskOpState>>> {
        let mut tx = self.pool.begin().await?;
        let current_row = sqlx::query(
            "SELECT task_path, repo, session_id, worktree, worker_id, slot, daemon_id,
                    heartbeat_at, released_at, released_reason
             FROM task_op_state WHERE task_path = ?",
        )
        .bind(&task.0)
        .fetch_optional(&mut *tx)
        .await?;

        let current = current_row.map(row_to_op_state).transpose()?;

        let matches = match (&current, expected) {
            (None, None) => true,
            (Some(c), Some(e)) => c.daemon_id == e.daemon_id && c.heartbeat_at == e.heartbeat_at,
            _ => false,
        };

        if !matches {
            tx.rollback().await?;
            return Ok(Err(current));
        }

        sqlx::query(
            r#"
            INSERT INTO task_op_state (task_path, repo, session_id, worktree, worker_id, slot,
                                        daemon_id, heartbeat_at, released_at, released_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (task_path) DO UPDATE SET
                repo = excluded.repo,
                session_id = excluded.session_id,
                worktree = excluded.worktree,
                worker_id = excluded.worker_id,
                slot = excluded.slot,
                daemon_id = excluded.daemon_id,
                heartbeat_at = excluded.heartbeat_at,
                released_at = excluded.released_at,
                released_reason = excluded.released_reason
            "#,
        )
        .bind(&next.task_path.0)
        .bind(&next.repo.0)
        .bind(&next.session_id)
        .bind(&next.worktree)
        .bind(&next.worker_id)
        .bind(next.slot.map(|s| s as i64))
        .bind(&next.daemon_id.0)
        .bind(next.heartbeat_at.to_rfc3339())
        .bind(next.released_at.map(|t| t.to_rfc3339()))
        .bind(&next.released_reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Ok(()))
    }

    async fn release_op_state(&self, task: &TaskPath, reason: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE task_op_state SET released_at = ?, released_reason = ? WHERE task_path = ?",
        )
        .bind(at.to_rfc3339())
        .bind(reason)
        .bind(&task.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_pr_snapshot(&self, snapshot: &PrSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pr_snapshots (url, repo, number, task_path, state, head_sha, head_ref,
                                       base_ref, merge_state, labels, author)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (url) DO UPDATE SET
                state = excluded.state,
                head_sha = excluded.head_sha,
                head_ref = excluded.head_ref,
                base_ref = excluded.base_ref,
                merge_state = excluded.merge_state,
                labels = excluded.labels,
                author = excluded.author
            "#,
        )
        .bind(&snapshot.url)
        .bind(&snapshot.repo.0)
        .bind(snapshot.number as i64)
        .bind(&snapshot.task.0)
        .bind(pr_state_str(&snapshot.state))
        .bind(&snapshot.head_sha)
        .bind(&snapshot.head_ref)
        .bind(&snapshot.base_ref)
        .bind(merge_state_str(&snapshot.merge_state))
        .bind(labels_to_json(&snapshot.labels))
        .bind(&snapshot.author)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_pr_snapshot(&self, url: &str) -> Result<Option<PrSnapshot>> {
        let row = sqlx::query(
            "SELECT url, repo, number, task_path, state, head_sha, head_ref, base_ref,
                    merge_state, labels, author FROM pr_snapshots WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_pr_snapshot).transpose()
    }

    async fn load_pr_snapshot_for_task(&self, task: &TaskPath) -> Result<Option<PrSnapshot>> {
        let row = sqlx::query(
            "SELECT url, repo, number, task_path, state, head_sha, head_ref, base_ref,
                    merge_state, labels, author FROM pr_snapshots WHERE task_path = ?",
        )
        .bind(&task.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_pr_snapshot).transpose()
    }

    async fn claim_idempotency_key(&self, key: &str, hash: &str) -> Result<IdempotencyClaim> {
        let result = sqlx::query("INSERT INTO idempotency_keys (key, hash) VALUES (?, ?) ON CONFLICT (key) DO NOTHING")
            .bind(key)
            .bind(hash)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(IdempotencyClaim::Claimed);
        }

        let existing: String = sqlx::query("SELECT hash FROM idempotency_keys WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?
            .get("hash");
        Ok(IdempotencyClaim::AlreadyPresent { hash: existing })
    }

    async fn idempotency_status(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT hash FROM idempotency_keys WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("hash")))
    }

    async fn set_parent_verification(
        &self,
        task: &TaskPath,
        status: ParentVerificationStatus,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO parent_verification (task_path, status) VALUES (?, ?)
             ON CONFLICT (task_path) DO UPDATE SET status = excluded.status",
        )
        .bind(&task.0)
        .bind(parent_verification_str(&status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_parent_verification(&self, task: &TaskPath) -> Result<Option<ParentVerificationStatus>> {
        let row = sqlx::query("SELECT status FROM parent_verification WHERE task_path = ?")
            .bind(&task.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parent_verification_from_str(r.get("status"))).transpose()
    }

    async fn save_escalation(&self, task: &TaskPath, escalation: &Escalation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO escalation_markers (task_path, escalation_type, reason, run_log_path)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (task_path) DO UPDATE SET
                escalation_type = excluded.escalation_type,
                reason = excluded.reason,
                run_log_path = excluded.run_log_path
            "#,
        )
        .bind(&task.0)
        .bind(format!("{:?}", escalation.escalation_type))
        .bind(&escalation.reason)
        .bind(&escalation.run_log_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_escalation(&self, task: &TaskPath) -> Result<Option<Escalation>> {
        let row = sqlx::query(
            "SELECT escalation_type, reason, run_log_path FROM escalation_markers WHERE task_path = ?",
        )
        .bind(&task.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => None,
            Some(row) => {
                let escalation_type_raw: String = row.get("escalation_type");
                Some(Escalation {
                    escalation_type: parse_escalation_type(&escalation_type_raw)?,
                    reason: row.get("reason"),
                    run_log_path: row.get("run_log_path"),
                })
            }
        })
    }

    async fn save_runtime_snapshot(&self, snapshot: &RuntimeSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runtime_snapshots (daemon_id, written_at, payload)
            VALUES (?, ?, ?)
            ON CONFLICT (daemon_id) DO UPDATE SET
                written_at = excluded.written_at,
                payload = excluded.payload
            "#,
        )
        .bind(&snapshot.daemon_id.0)
        .bind(snapshot.written_at.to_rfc3339())
        .bind(serde_json::to_string(&snapshot.payload)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_runtime_snapshot(&self, daemon_id: &str) -> Result<Option<RuntimeSnapshot>> {
        let row = sqlx::query("SELECT daemon_id, written_at, payload FROM runtime_snapshots WHERE daemon_id = ?")
            .bind(daemon_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            None => None,
            Some(row) => {
                let written_at: String = row.get("written_at");
                let payload: String = row.get("payload");
                Some(RuntimeSnapshot {
                    daemon_id: DaemonId(row.get("daemon_id")),
                    written_at: DateTime::parse_from_rfc3339(&written_at)?.with_timezone(&Utc),
                    payload: serde_json::from_str(&payload)?,
                })
            }
        })
    }

    async fn append_event(&self, event: &RalphEvent, at: DateTime<Utc>) -> Result<u64> {
        let payload = serde_json::to_string(event)?;
        let result = sqlx::query("INSERT INTO events (at, kind, payload) VALUES (?, ?, ?)")
            .bind(at.to_rfc3339())
            .bind(event.kind())
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid() as u64)
    }

    async fn read_events(&self, from_seq: u64, limit: usize) -> Result<Vec<(u64, DateTime<Utc>, RalphEvent)>> {
        let rows = sqlx::query(
            "SELECT seq, at, payload FROM events WHERE seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(from_seq as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let seq: i64 = row.get("seq");
                let at: String = row.get("at");
                let payload: String = row.get("payload");
                Ok((
                    seq as u64,
                    DateTime::parse_from_rfc3339(&at)?.with_timezone(&Utc),
                    serde_json::from_str(&payload)?,
                ))
            })
            .collect()
    }
}

fn row_to_issue_snapshot(row: sqlx::sqlite::SqliteRow) -> Result<IssueSnapshot> {
    let open_state_raw: String = row.get("open_state");
    let labels_raw: String = row.get("labels");
    let updated_at_raw: String = row.get("updated_at");
    Ok(IssueSnapshot {
        repo: RepoId(row.get("repo")),
        number: { let n: i64 = row.get("number"); n as u64 },
        node_id: row.get("node_id"),
        title: row.get("title"),
        open_state: open_state_from_str(&open_state_raw)?,
        labels: labels_from_json(&labels_raw),
        updated_at: DateTime::parse_from_rfc3339(&updated_at_raw)?.with_timezone(&Utc),
        author: row.get("author"),
    })
}

fn row_to_op_state(row: sqlx::sqlite::SqliteRow) -> Result<TaskOpState> {
    let heartbeat_raw: String = row.get("heartbeat_at");
    let released_at_raw: Option<String> = row.get("released_at");
    let slot: Option<i64> = row.get("slot");
    Ok(TaskOpState {
        repo: RepoId(row.get("repo")),
        task_path: TaskPath(row.get("task_path")),
        session_id: row.get("session_id"),
        worktree: row.get("worktree"),
        worker_id: row.get("worker_id"),
        slot: slot.map(|s| s as u32),
        daemon_id: DaemonId(row.get("daemon_id")),
        heartbeat_at: DateTime::parse_from_rfc3339(&heartbeat_raw)?.with_timezone(&Utc),
        released_at: released_at_raw
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()?,
        released_reason: row.get("released_reason"),
    })
}

fn row_to_pr_snapshot(row: sqlx::sqlite::SqliteRow) -> Result<PrSnapshot> {
    let state_raw: String = row.get("state");
    let merge_state_raw: String = row.get("merge_state");
    let labels_raw: String = row.get("labels");
    Ok(PrSnapshot {
        url: row.get("url"),
        repo: RepoId(row.get("repo")),
        number: { let n: i64 = row.get("number"); n as u64 },
        task: TaskPath(row.get("task_path")),
        state: pr_state_from_str(&state_raw)?,
        head_sha: row.get("head_sha"),
        head_ref: row.get("head_ref"),
        base_ref: row.get("base_ref"),
        merge_state: merge_state_from_str(&merge_state_raw),
        labels: labels_from_json(&labels_raw),
        author: row.get("author"),
    })
}

fn parse_escalation_type(raw: &str) -> Result<crate::types::EscalationType> {
    use crate::types::EscalationType::*;
    Ok(match raw {
        "ProductGap" => ProductGap,
        "LowConfidence" => LowConfidence,
        "AmbiguousRequirements" => AmbiguousRequirements,
        "Blocked" => Blocked,
        "MergeConflict" => MergeConflict,
        _ => Other,
    })
}
