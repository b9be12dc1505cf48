use async_trait::async_trait;
use ralph_core::clock::{Clock, FakeClock};
use ralph_core::control::ControlPlane;
use ralph_core::errors::{RalphError, RalphResult};
use ralph_core::escalation::{is_resolved_comment, EscalationWriteback};
use ralph_core::governor::{BudgetGovernor, Cost, Decision, Lane};
use ralph_core::hosting::{
    BranchUpdateOutcome, CommentPatch, HostingClient, IssueMutation, MergeOutcome, MergeRequest, PrView,
};
use ralph_core::merge_gate::{GateOutcome, MergeGate};
use ralph_core::notify::{NullNotifier, RecordingNotifier};
use ralph_core::relationship::{decide, BlockDecision, Coverage, DependencySignal, SignalKind, SignalSource, SignalState};
use ralph_core::session::ScriptedSessionRunner;
use ralph_core::store::Store;
use ralph_core::store_memory::MemoryStore;
use ralph_core::types::{
    CheckState, DaemonId, EscalationType, IssueOpenState, IssueSnapshot, MergeStateStatus, PrSnapshot, PrState,
    RepoConfig, RepoId, RequiredCheck, TaskPath, TokenId,
};
use ralph_core::worker::LifecycleWorker;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Scriptable `HostingClient` double: one call sequence per test, driven by
/// a mutable queue of canned responses rather than a real server.
struct FakeHostingClient {
    issues: Mutex<HashMap<(String, u64), IssueSnapshot>>,
    pr_views: Mutex<HashMap<String, Vec<PrView>>>,
    merge_responses: Mutex<HashMap<String, Vec<MergeOutcome>>>,
    branch_update_calls: Mutex<u32>,
    merge_calls: Mutex<Vec<String>>,
    comments: Mutex<HashMap<(String, u64), Vec<(String, String)>>>,
}

impl FakeHostingClient {
    fn new() -> Self {
        Self {
            issues: Mutex::new(HashMap::new()),
            pr_views: Mutex::new(HashMap::new()),
            merge_responses: Mutex::new(HashMap::new()),
            branch_update_calls: Mutex::new(0),
            merge_calls: Mutex::new(Vec::new()),
            comments: Mutex::new(HashMap::new()),
        }
    }

    fn seed_issue(&self, snapshot: IssueSnapshot) {
        self.issues.lock().unwrap().insert((snapshot.repo.0.clone(), snapshot.number), snapshot);
    }

    fn seed_pr_views(&self, url: &str, views: Vec<PrView>) {
        self.pr_views.lock().unwrap().insert(url.to_string(), views);
    }

    fn seed_merge_responses(&self, url: &str, outcomes: Vec<MergeOutcome>) {
        self.merge_responses.lock().unwrap().insert(url.to_string(), outcomes);
    }
}

#[async_trait]
impl HostingClient for FakeHostingClient {
    async fn fetch_issue(&self, repo: &RepoId, number: u64) -> RalphResult<IssueSnapshot> {
        self.issues
            .lock()
            .unwrap()
            .get(&(repo.0.clone(), number))
            .cloned()
            .ok_or(RalphError::HostingHttp { status: 404, endpoint: "issues".into() })
    }

    async fn mutate_issue_labels(&self, repo: &RepoId, number: u64, mutation: &IssueMutation) -> RalphResult<()> {
        let mut issues = self.issues.lock().unwrap();
        if let Some(issue) = issues.get_mut(&(repo.0.clone(), number)) {
            for l in &mutation.add_labels {
                issue.labels.insert(l.clone());
            }
            for l in &mutation.remove_labels {
                issue.labels.remove(l);
            }
        }
        Ok(())
    }

    async fn ensure_label(&self, _repo: &RepoId, _label: &str) -> RalphResult<()> {
        Ok(())
    }

    async fn list_recent_comments(&self, repo: &RepoId, number: u64, _page_depth: u32) -> RalphResult<Vec<(String, String)>> {
        Ok(self.comments.lock().unwrap().get(&(repo.0.clone(), number)).cloned().unwrap_or_default())
    }

    async fn upsert_comment(&self, repo: &RepoId, number: u64, patch: &CommentPatch) -> RalphResult<String> {
        let mut comments = self.comments.lock().unwrap();
        let list = comments.entry((repo.0.clone(), number)).or_default();
        let id = patch.comment_id.clone().unwrap_or_else(|| format!("c{}", list.len() + 1));
        list.retain(|(existing_id, _)| existing_id != &id);
        list.push((id.clone(), patch.body.clone()));
        Ok(id)
    }

    async fn fetch_pr(&self, _repo: &RepoId, pr_url: &str) -> RalphResult<PrView> {
        let mut views = self.pr_views.lock().unwrap();
        let queue = views.get_mut(pr_url).expect("pr view queued");
        if queue.len() > 1 {
            Ok(queue.remove(0))
        } else {
            Ok(queue[0].clone())
        }
    }

    async fn update_branch(&self, _repo: &RepoId, _pr_url: &str) -> RalphResult<BranchUpdateOutcome> {
        *self.branch_update_calls.lock().unwrap() += 1;
        Ok(BranchUpdateOutcome::Updated { new_head_sha_known: true })
    }

    async fn merge_pr(&self, _repo: &RepoId, request: &MergeRequest) -> RalphResult<MergeOutcome> {
        self.merge_calls.lock().unwrap().push(request.expected_head_sha.clone());
        let mut responses = self.merge_responses.lock().unwrap();
        let queue = responses.get_mut(&request.pr_url).expect("merge response queued");
        Ok(if queue.len() > 1 { queue.remove(0) } else { queue[0].clone() })
    }

    async fn delete_branch(&self, _repo: &RepoId, _branch: &str) -> RalphResult<()> {
        Ok(())
    }

    async fn graph_dependency_signals(&self, _repo: &RepoId, _number: u64) -> RalphResult<Vec<DependencySignal>> {
        Ok(vec![])
    }
}

fn test_repo_config(repo: &RepoId) -> RepoConfig {
    RepoConfig {
        id: repo.clone(),
        token_id: TokenId("t1".into()),
        bot_branch: "bot/integration".into(),
        required_checks: vec!["ci".into()],
        auto_update_enabled: true,
        auto_update_min_minutes: 0,
        auto_update_label_gate: None,
        auto_queue: true,
        allowlisted_owners: BTreeSet::new(),
        max_workers: 1,
        ci_fix_attempts: 5,
        merge_retry_limit: 1,
        required_check_timeout_secs: 60,
        merge_poll_interval_secs: 0,
    }
}

fn pr_snapshot(repo: &RepoId, url: &str, head_sha: &str, merge_state: MergeStateStatus, labels: BTreeSet<String>) -> PrSnapshot {
    PrSnapshot {
        url: url.into(),
        repo: repo.clone(),
        number: 999,
        task: TaskPath::new(repo, 1),
        state: PrState::Open,
        head_sha: head_sha.into(),
        head_ref: "ralph/task-1".into(),
        base_ref: "bot/integration".into(),
        merge_state,
        labels,
        author: "ralph-bot".into(),
    }
}

/// E1 — happy path: clean merge state, required check green, merge succeeds
/// on the first attempt.
#[tokio::test]
async fn e1_happy_path_merges_on_first_attempt() {
    let repo = RepoId("acme/widgets".into());
    let url = "https://github.com/acme/widgets/pull/999";
    let hosting = Arc::new(FakeHostingClient::new());
    hosting.seed_pr_views(
        url,
        vec![PrView {
            snapshot: pr_snapshot(&repo, url, "sha1", MergeStateStatus::Clean, BTreeSet::new()),
            checks: vec![RequiredCheck { name: "ci".into(), state: CheckState::Success }],
        }],
    );
    hosting.seed_merge_responses(url, vec![MergeOutcome::Merged { sha: "mergesha1".into() }]);

    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
    let gate = MergeGate::new(hosting.clone(), clock);
    let config = test_repo_config(&repo);

    let outcome = gate.run(&repo, url, &config, chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(outcome, GateOutcome::Merged { sha: "mergesha1".into() });
    assert_eq!(*hosting.merge_calls.lock().unwrap(), vec!["sha1".to_string()]);
}

/// E2 — CI-only PR for a non-CI issue: modeled at the relationship/label
/// layer as a deliberate escalation decision upstream of the merge gate —
/// the merge gate is never invoked, only the writeback contract is checked.
#[tokio::test]
async fn e2_ci_only_pr_blocks_before_merge_attempt() {
    let repo = RepoId("acme/widgets".into());
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let hosting = Arc::new(FakeHostingClient::new());
    hosting.seed_issue(IssueSnapshot {
        repo: repo.clone(),
        number: 1,
        node_id: "n1".into(),
        title: "docs only".into(),
        open_state: IssueOpenState::Open,
        labels: BTreeSet::from(["ralph:status:in-progress".to_string()]),
        updated_at: chrono::Utc::now(),
        author: "someone".into(),
    });
    let notifier = Arc::new(RecordingNotifier::new());
    let writeback = EscalationWriteback::new(store.clone(), hosting.clone(), notifier.clone());

    let reason = "Blocked: CI-only PR for non-CI issue";
    writeback
        .escalate(&repo, 1, &TaskPath::new(&repo, 1), EscalationType::Blocked, reason, None)
        .await
        .unwrap();

    let sent = notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].message.starts_with("Blocked: CI-only PR for non-CI issue"));
    assert!(hosting.merge_calls.lock().unwrap().is_empty());
}

/// E3 — behind-branch recovery: first merge reports head-not-up-to-date,
/// one branch-update happens, second merge with the refreshed SHA succeeds.
#[tokio::test]
async fn e3_behind_branch_then_merge_succeeds_with_one_branch_update() {
    let repo = RepoId("acme/widgets".into());
    let url = "https://github.com/acme/widgets/pull/999";
    let hosting = Arc::new(FakeHostingClient::new());
    hosting.seed_pr_views(
        url,
        vec![
            PrView {
                snapshot: pr_snapshot(&repo, url, "sha1", MergeStateStatus::Clean, BTreeSet::new()),
                checks: vec![RequiredCheck { name: "ci".into(), state: CheckState::Success }],
            },
            PrView {
                snapshot: pr_snapshot(&repo, url, "sha2", MergeStateStatus::Clean, BTreeSet::new()),
                checks: vec![RequiredCheck { name: "ci".into(), state: CheckState::Success }],
            },
        ],
    );
    hosting.seed_merge_responses(
        url,
        vec![MergeOutcome::HeadNotUpToDate, MergeOutcome::Merged { sha: "mergesha2".into() }],
    );

    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
    let gate = MergeGate::new(hosting.clone(), clock);
    let config = test_repo_config(&repo);

    let outcome = gate.run(&repo, url, &config, chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(outcome, GateOutcome::Merged { sha: "mergesha2".into() });
    assert_eq!(*hosting.branch_update_calls.lock().unwrap(), 1);
    let calls = hosting.merge_calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0], calls[1]);
}

/// E4 — conflict detected mid-wait for required checks: the gate
/// short-circuits to `Conflict`, never attempting a merge.
#[tokio::test]
async fn e4_conflict_during_required_check_wait_short_circuits() {
    let repo = RepoId("acme/widgets".into());
    let url = "https://github.com/acme/widgets/pull/999";
    let hosting = Arc::new(FakeHostingClient::new());
    hosting.seed_pr_views(
        url,
        vec![
            PrView {
                snapshot: pr_snapshot(&repo, url, "sha1", MergeStateStatus::Clean, BTreeSet::new()),
                checks: vec![RequiredCheck { name: "ci".into(), state: CheckState::Pending }],
            },
            PrView {
                snapshot: pr_snapshot(&repo, url, "sha1", MergeStateStatus::Dirty, BTreeSet::new()),
                checks: vec![RequiredCheck { name: "ci".into(), state: CheckState::Pending }],
            },
        ],
    );

    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
    let gate = MergeGate::new(hosting.clone(), clock);
    let config = test_repo_config(&repo);

    let outcome = gate.run(&repo, url, &config, chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(outcome, GateOutcome::Conflict { head_sha: "sha1".into() });
    assert!(hosting.merge_calls.lock().unwrap().is_empty());
}

/// E5 — hard throttle: the governor defers before any hosting call is made.
#[tokio::test]
async fn e5_hard_throttle_defers_without_any_hosting_call() {
    let gov = BudgetGovernor::new(NonZeroU32::new(1).unwrap(), NonZeroU32::new(1).unwrap(), 1);
    let repo = RepoId("acme/widgets".into());
    let token = TokenId("t1".into());
    gov.set_global_cooldown(chrono::Utc::now() + chrono::Duration::seconds(60));

    let decision = gov.acquire(&repo, &token, Lane::Important, Cost::Read);
    assert!(matches!(decision, Decision::Defer { .. }));
}

/// E6 — body-vs-graph dependency signals: complete graph coverage with no
/// open blocker queues the task even though the body mentions `#12`;
/// incomplete graph coverage with an open body signal blocks it.
#[tokio::test]
async fn e6_graph_complete_beats_body_mention() {
    let coverage = Coverage { graph_deps_complete: true, graph_sub_issues_complete: true, body_deps: true };
    let signals = vec![DependencySignal { kind: SignalKind::BlockedBy, source: SignalSource::Graph, state: SignalState::Closed }];
    assert_eq!(decide(&signals, &coverage), BlockDecision::Runnable);
}

#[tokio::test]
async fn e6_incomplete_graph_with_open_body_signal_blocks() {
    let coverage = Coverage { graph_deps_complete: false, graph_sub_issues_complete: false, body_deps: true };
    let signals = vec![DependencySignal { kind: SignalKind::BlockedBy, source: SignalSource::Body, state: SignalState::Open }];
    assert_eq!(decide(&signals, &coverage), BlockDecision::Blocked);
}

/// E7 — RALPH RESOLVED reconciliation: only a privileged author's comment
/// clears the escalation; an identical comment from anyone else is ignored.
#[tokio::test]
async fn e7_operator_resolved_comment_is_recognized_non_operator_is_not() {
    assert!(is_resolved_comment("RALPH RESOLVED: proceed", "OWNER"));
    assert!(is_resolved_comment("RALPH RESOLVED: proceed", "COLLABORATOR"));
    assert!(!is_resolved_comment("RALPH RESOLVED: proceed", "NONE"));
}

fn test_worker(hosting: Arc<FakeHostingClient>, daemon_id: DaemonId) -> LifecycleWorker {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
    let sessions = Arc::new(ScriptedSessionRunner::default());
    let governor = Arc::new(BudgetGovernor::new(NonZeroU32::new(600).unwrap(), NonZeroU32::new(200).unwrap(), 20));
    let control = Arc::new(ControlPlane::new("nonexistent-control.json"));
    let merge_gate = Arc::new(MergeGate::new(hosting.clone(), clock.clone()));
    let escalation = Arc::new(EscalationWriteback::new(store.clone(), hosting.clone(), Arc::new(NullNotifier)));
    LifecycleWorker::new(
        0,
        daemon_id,
        store,
        sessions,
        governor,
        control,
        merge_gate,
        escalation,
        clock,
        hosting,
        Arc::new(NullNotifier),
    )
}

/// E8 — pre-flight rejection: an issue author outside the allowlist is
/// rejected before any session is opened or event is written, and the
/// worker reports `Blocked` rather than attempting the task.
#[tokio::test]
async fn e8_preflight_rejects_non_allowlisted_author_before_any_session_call() {
    let repo = RepoId("acme/widgets".into());
    let hosting = Arc::new(FakeHostingClient::new());
    let worker = test_worker(hosting.clone(), DaemonId("d1".into()));

    let mut config = test_repo_config(&repo);
    config.allowlisted_owners = BTreeSet::from(["trusted-owner".to_string()]);

    let task = TaskPath::new(&repo, 1);
    let shutdown = CancellationToken::new();
    let outcome = worker
        .run_task(&repo, 1, &task, "untrusted-author", true, &config, "/tmp/does-not-matter", None, &shutdown)
        .await
        .unwrap();

    assert_eq!(outcome, ralph_core::types::TaskOutcome::Blocked);
    assert!(hosting.merge_calls.lock().unwrap().is_empty());
}

/// E9 — closed issue is rejected as `Failed` at pre-flight, independent of
/// the allowlist gate.
#[tokio::test]
async fn e9_preflight_rejects_closed_issue() {
    let repo = RepoId("acme/widgets".into());
    let hosting = Arc::new(FakeHostingClient::new());
    let worker = test_worker(hosting.clone(), DaemonId("d1".into()));
    let config = test_repo_config(&repo);

    let task = TaskPath::new(&repo, 1);
    let shutdown = CancellationToken::new();
    let outcome = worker
        .run_task(&repo, 1, &task, "anyone", false, &config, "/tmp/does-not-matter", None, &shutdown)
        .await
        .unwrap();

    assert_eq!(outcome, ralph_core::types::TaskOutcome::Failed);
}

/// E10 — a worktree missing `.ralph/plan.md` is rejected as `Failed` even
/// though author/issue-open/throttle gates all pass.
#[tokio::test]
async fn e10_preflight_rejects_worktree_missing_plan_artifact() {
    let repo = RepoId("acme/widgets".into());
    let hosting = Arc::new(FakeHostingClient::new());
    let worker = test_worker(hosting.clone(), DaemonId("d1".into()));
    let config = test_repo_config(&repo);

    let dir = tempfile::tempdir().unwrap();
    let task = TaskPath::new(&repo, 1);
    let shutdown = CancellationToken::new();
    let outcome = worker
        .run_task(&repo, 1, &task, "anyone", true, &config, dir.path().to_str().unwrap(), None, &shutdown)
        .await
        .unwrap();

    assert_eq!(outcome, ralph_core::types::TaskOutcome::Failed);
}
