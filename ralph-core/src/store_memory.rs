use crate::events::RalphEvent;
use crate::store::Store;
use crate::types::{
    Escalation, IdempotencyClaim, IssueSnapshot, ParentVerificationStatus, PrSnapshot, RepoId,
    RuntimeSnapshot, TaskOpState, TaskPath,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

struct Inner {
    issue_snapshots: HashMap<(RepoId, u64), IssueSnapshot>,
    op_states: HashMap<TaskPath, TaskOpState>,
    pr_snapshots: HashMap<String, PrSnapshot>,
    idempotency_keys: HashMap<String, String>,
    parent_verification: HashMap<TaskPath, ParentVerificationStatus>,
    escalations: HashMap<TaskPath, Escalation>,
    runtime_snapshots: HashMap<String, RuntimeSnapshot>,
    events: Vec<(u64, DateTime<Utc>, RalphEvent)>,
    event_seq: u64,
}

/// In-memory `Store` implementation used by unit tests and the end-to-end
/// scenario suite. No test opens a real SQLite file.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                issue_snapshots: HashMap::new(),
                op_states: HashMap::new(),
                pr_snapshots: HashMap::new(),
                idempotency_keys: HashMap::new(),
                parent_verification: HashMap::new(),
                escalations: HashMap::new(),
                runtime_snapshots: HashMap::new(),
                events: Vec::new(),
                event_seq: 0,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_issue_snapshot(&self, snapshot: &IssueSnapshot) -> Result<()> {
        let mut w = self.inner.write().await;
        w.issue_snapshots
            .insert((snapshot.repo.clone(), snapshot.number), snapshot.clone());
        Ok(())
    }

    async fn load_issue_snapshot(&self, repo: &RepoId, number: u64) -> Result<Option<IssueSnapshot>> {
        let r = self.inner.read().await;
        Ok(r.issue_snapshots.get(&(repo.clone(), number)).cloned())
    }

    async fn list_issue_snapshots(&self, repo: &RepoId) -> Result<Vec<IssueSnapshot>> {
        let r = self.inner.read().await;
        let mut out: Vec<IssueSnapshot> = r
            .issue_snapshots
            .values()
            .filter(|s| &s.repo == repo)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.number);
        Ok(out)
    }

    async fn load_op_state(&self, task: &TaskPath) -> Result<Option<TaskOpState>> {
        let r = self.inner.read().await;
        Ok(r.op_states.get(task).cloned())
    }

    async fn list_op_states(&self, repo: &RepoId) -> Result<Vec<TaskOpState>> {
        let r = self.inner.read().await;
        let mut out: Vec<TaskOpState> = r
            .op_states
            .values()
            .filter(|s| &s.repo == repo)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.task_path.0.cmp(&b.task_path.0));
        Ok(out)
    }

    async fn compare_and_set_op_state(
        &self,
        task: &TaskPath,
        expected: Option<&TaskOpState>,
        next: &TaskOpState,
    ) -> Result<Result<(), Option<TaskOpState>>> {
        let mut w = self.inner.write().await;
        let current = w.op_states.get(task).cloned();
        let matches = match (&current, expected) {
            (None, None) => true,
            (Some(c), Some(e)) => c.daemon_id == e.daemon_id && c.heartbeat_at == e.heartbeat_at,
            _ => false,
        };
        if matches {
            w.op_states.insert(task.clone(), next.clone());
            Ok(Ok(()))
        } else {
            Ok(Err(current))
        }
    }

    async fn release_op_state(&self, task: &TaskPath, reason: &str, at: DateTime<Utc>) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(state) = w.op_states.get_mut(task) {
            state.released_at = Some(at);
            state.released_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn save_pr_snapshot(&self, snapshot: &PrSnapshot) -> Result<()> {
        let mut w = self.inner.write().await;
        w.pr_snapshots.insert(snapshot.url.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_pr_snapshot(&self, url: &str) -> Result<Option<PrSnapshot>> {
        let r = self.inner.read().await;
        Ok(r.pr_snapshots.get(url).cloned())
    }

    async fn load_pr_snapshot_for_task(&self, task: &TaskPath) -> Result<Option<PrSnapshot>> {
        let r = self.inner.read().await;
        Ok(r.pr_snapshots.values().find(|pr| &pr.task == task).cloned())
    }

    async fn claim_idempotency_key(&self, key: &str, hash: &str) -> Result<IdempotencyClaim> {
        let mut w = self.inner.write().await;
        match w.idempotency_keys.get(key) {
            Some(existing) => Ok(IdempotencyClaim::AlreadyPresent {
                hash: existing.clone(),
            }),
            None => {
                w.idempotency_keys.insert(key.to_string(), hash.to_string());
                Ok(IdempotencyClaim::Claimed)
            }
        }
    }

    async fn idempotency_status(&self, key: &str) -> Result<Option<String>> {
        let r = self.inner.read().await;
        Ok(r.idempotency_keys.get(key).cloned())
    }

    async fn set_parent_verification(
        &self,
        task: &TaskPath,
        status: ParentVerificationStatus,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        w.parent_verification.insert(task.clone(), status);
        Ok(())
    }

    async fn get_parent_verification(&self, task: &TaskPath) -> Result<Option<ParentVerificationStatus>> {
        let r = self.inner.read().await;
        Ok(r.parent_verification.get(task).copied())
    }

    async fn save_escalation(&self, task: &TaskPath, escalation: &Escalation) -> Result<()> {
        let mut w = self.inner.write().await;
        w.escalations.insert(task.clone(), escalation.clone());
        Ok(())
    }

    async fn load_escalation(&self, task: &TaskPath) -> Result<Option<Escalation>> {
        let r = self.inner.read().await;
        Ok(r.escalations.get(task).cloned())
    }

    async fn save_runtime_snapshot(&self, snapshot: &RuntimeSnapshot) -> Result<()> {
        let mut w = self.inner.write().await;
        w.runtime_snapshots
            .insert(snapshot.daemon_id.0.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_runtime_snapshot(&self, daemon_id: &str) -> Result<Option<RuntimeSnapshot>> {
        let r = self.inner.read().await;
        Ok(r.runtime_snapshots.get(daemon_id).cloned())
    }

    async fn append_event(&self, event: &RalphEvent, at: DateTime<Utc>) -> Result<u64> {
        let mut w = self.inner.write().await;
        w.event_seq += 1;
        let seq = w.event_seq;
        w.events.push((seq, at, event.clone()));
        Ok(seq)
    }

    async fn read_events(&self, from_seq: u64, limit: usize) -> Result<Vec<(u64, DateTime<Utc>, RalphEvent)>> {
        let r = self.inner.read().await;
        Ok(r.events
            .iter()
            .filter(|(seq, _, _)| *seq > from_seq)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DaemonId;

    fn op_state(daemon: &str, hb: DateTime<Utc>) -> TaskOpState {
        TaskOpState {
            repo: RepoId("acme/widgets".into()),
            task_path: TaskPath("github:acme/widgets#1".into()),
            session_id: None,
            worktree: None,
            worker_id: None,
            slot: None,
            daemon_id: DaemonId(daemon.into()),
            heartbeat_at: hb,
            released_at: None,
            released_reason: None,
        }
    }

    #[tokio::test]
    async fn cas_succeeds_on_matching_expected() {
        let store = MemoryStore::new();
        let task = TaskPath("github:acme/widgets#1".into());
        let now = Utc::now();
        let first = op_state("d1", now);
        let result = store
            .compare_and_set_op_state(&task, None, &first)
            .await
            .unwrap();
        assert!(result.is_ok());

        let second = op_state("d1", now + chrono::Duration::seconds(10));
        let result = store
            .compare_and_set_op_state(&task, Some(&first), &second)
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cas_fails_on_stale_expected() {
        let store = MemoryStore::new();
        let task = TaskPath("github:acme/widgets#1".into());
        let now = Utc::now();
        let first = op_state("d1", now);
        store.compare_and_set_op_state(&task, None, &first).await.unwrap().unwrap();

        let rival = op_state("d2", now);
        let result = store
            .compare_and_set_op_state(&task, None, &rival)
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn idempotency_key_second_claim_sees_original_hash() {
        let store = MemoryStore::new();
        let claim = store.claim_idempotency_key("k1", "hash-a").await.unwrap();
        assert!(matches!(claim, IdempotencyClaim::Claimed));

        let claim = store.claim_idempotency_key("k1", "hash-b").await.unwrap();
        assert!(matches!(claim, IdempotencyClaim::AlreadyPresent { hash } if hash == "hash-a"));
    }

    #[tokio::test]
    async fn list_issue_snapshots_sorted_by_number() {
        let store = MemoryStore::new();
        let repo = RepoId("acme/widgets".into());
        for n in [3u64, 1, 2] {
            store
                .save_issue_snapshot(&IssueSnapshot {
                    repo: repo.clone(),
                    number: n,
                    node_id: format!("n{n}"),
                    title: "t".into(),
                    open_state: crate::types::IssueOpenState::Open,
                    labels: Default::default(),
                    updated_at: Utc::now(),
                    author: "someone".into(),
                })
                .await
                .unwrap();
        }
        let listed = store.list_issue_snapshots(&repo).await.unwrap();
        let numbers: Vec<u64> = listed.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn event_log_reads_after_seq() {
        let store = MemoryStore::new();
        let task = TaskPath("github:acme/widgets#1".into());
        for _ in 0..3 {
            store
                .append_event(
                    &RalphEvent::TaskReleased {
                        task: task.clone(),
                        reason: "done".into(),
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        let events = store.read_events(1, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, 2);
    }
}
