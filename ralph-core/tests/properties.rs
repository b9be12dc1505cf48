use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use ralph_core::label_io::plan_label_ops;
use ralph_core::relationship::{decide, BlockDecision, Coverage, DependencySignal, SignalKind, SignalSource, SignalState};
use ralph_core::types::{DaemonId, RepoId, TaskOpState, TaskPath};
use std::collections::BTreeSet;

fn fixed_instant(epoch_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch_secs, 0).unwrap()
}

fn op_state(owner: DaemonId, heartbeat_at: DateTime<Utc>, released: bool) -> TaskOpState {
    TaskOpState {
        repo: RepoId("acme/widgets".into()),
        task_path: TaskPath("tasks/one.md".into()),
        session_id: None,
        worktree: None,
        worker_id: None,
        slot: None,
        daemon_id: owner,
        heartbeat_at,
        released_at: if released { Some(heartbeat_at) } else { None },
        released_reason: if released { Some("done".into()) } else { None },
    }
}

fn ralph_label() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("ralph:status:queued".to_string()),
        Just("ralph:status:in-progress".to_string()),
        Just("ralph:status:blocked".to_string()),
        Just("ralph:status:done".to_string()),
    ]
}

fn signal() -> impl Strategy<Value = DependencySignal> {
    (
        prop_oneof![Just(SignalKind::BlockedBy), Just(SignalKind::SubIssue)],
        prop_oneof![Just(SignalSource::Graph), Just(SignalSource::Body)],
        prop_oneof![Just(SignalState::Open), Just(SignalState::Closed)],
    )
        .prop_map(|(kind, source, state)| DependencySignal { kind, source, state })
}

fn coverage() -> impl Strategy<Value = Coverage> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(a, b, c)| Coverage {
        graph_deps_complete: a,
        graph_sub_issues_complete: b,
        body_deps: c,
    })
}

proptest! {
    /// Invariant 1: a label set driven entirely by status-mapped add/remove
    /// pairs settles, and re-running the same plan against the settled set
    /// produces no further ops (idempotent convergence).
    #[test]
    fn plan_label_ops_converges(current in proptest::collection::btree_set(ralph_label(), 0..4),
                                 add in proptest::collection::btree_set(ralph_label(), 0..4),
                                 remove in proptest::collection::btree_set(ralph_label(), 0..4)) {
        let (to_add, to_remove) = plan_label_ops(&current, &add, &remove, false).unwrap();
        let mut next = current.clone();
        for l in &to_add { next.insert(l.clone()); }
        for l in &to_remove { next.remove(l); }

        let (second_add, second_remove) = plan_label_ops(&next, &add, &remove, false).unwrap();
        prop_assert!(second_add.is_empty());
        prop_assert!(second_remove.is_empty());
    }

    /// Invariant 1 (disjointness half): the planned add and remove sets for
    /// a single call never overlap.
    #[test]
    fn plan_label_ops_add_and_remove_never_overlap(current in proptest::collection::btree_set(ralph_label(), 0..4),
                                                    add in proptest::collection::btree_set(ralph_label(), 0..4),
                                                    remove in proptest::collection::btree_set(ralph_label(), 0..4)) {
        let (to_add, to_remove) = plan_label_ops(&current, &add, &remove, false).unwrap();
        let add_set: BTreeSet<_> = to_add.into_iter().collect();
        let remove_set: BTreeSet<_> = to_remove.into_iter().collect();
        prop_assert!(add_set.is_disjoint(&remove_set));
    }

    /// Invariant 7: whenever C5 returns `unknown`, no signal in the input
    /// was an open one — an auto-queue sweeper gating on this result has
    /// nothing to react to, so it cannot be tempted into a label mutation.
    #[test]
    fn decide_unknown_implies_no_open_signal(signals in proptest::collection::vec(signal(), 0..5), cov in coverage()) {
        if decide(&signals, &cov) == BlockDecision::Unknown {
            prop_assert!(!signals.iter().any(|s| s.state == SignalState::Open));
        }
    }

    /// Invariant 7 (converse): any open graph `blocked-by` signal always
    /// yields `blocked`, regardless of coverage flags.
    #[test]
    fn decide_open_graph_blocker_always_blocks(mut signals in proptest::collection::vec(signal(), 0..5), cov in coverage()) {
        signals.push(DependencySignal { kind: SignalKind::BlockedBy, source: SignalSource::Graph, state: SignalState::Open });
        prop_assert_eq!(decide(&signals, &cov), BlockDecision::Blocked);
    }

    /// Invariant 2: a non-released op-state is exactly one of owned-by-its-
    /// daemon-and-live or stale, never both, regardless of elapsed time.
    #[test]
    fn op_state_ownership_and_staleness_are_mutually_exclusive(
        started_at in 0i64..1_000_000,
        elapsed_secs in 0i64..10_000,
        ttl_secs in 1i64..3_600,
    ) {
        let owner = DaemonId("d-1".into());
        let heartbeat_at = fixed_instant(started_at);
        let now = heartbeat_at + ChronoDuration::seconds(elapsed_secs);
        let ttl = ChronoDuration::seconds(ttl_secs);
        let state = op_state(owner.clone(), heartbeat_at, false);

        let owned = state.is_owned_by(&owner, now, ttl);
        let stale = state.is_stale(now, ttl);
        prop_assert!(!(owned && stale));
        prop_assert_eq!(owned, elapsed_secs <= ttl_secs);
        prop_assert_eq!(stale, elapsed_secs > ttl_secs);
    }

    /// Invariant 2: a released op-state is never owned and never stale —
    /// release is terminal.
    #[test]
    fn op_state_released_is_never_owned_or_stale(
        started_at in 0i64..1_000_000,
        elapsed_secs in 0i64..10_000,
        ttl_secs in 1i64..3_600,
    ) {
        let owner = DaemonId("d-1".into());
        let heartbeat_at = fixed_instant(started_at);
        let now = heartbeat_at + ChronoDuration::seconds(elapsed_secs);
        let ttl = ChronoDuration::seconds(ttl_secs);
        let state = op_state(owner.clone(), heartbeat_at, true);

        prop_assert!(!state.is_owned_by(&owner, now, ttl));
        prop_assert!(!state.is_stale(now, ttl));
    }
}
