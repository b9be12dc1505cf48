use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    BlockedBy,
    SubIssue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSource {
    Graph,
    Body,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalState {
    Open,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySignal {
    pub kind: SignalKind,
    pub source: SignalSource,
    pub state: SignalState,
}

/// Provider coverage flags: whether graph-sourced deps/sub-issues are
/// known to be complete, and whether body text was scanned at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub graph_deps_complete: bool,
    pub graph_sub_issues_complete: bool,
    pub body_deps: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockDecision {
    Blocked,
    Runnable,
    Unknown,
}

/// The sole authority on dependency blocking (spec.md §4.5). Pure and
/// side-effect-free so it is exercised directly by property tests without
/// a fake server (spec.md §8 invariant 7).
pub fn decide(signals: &[DependencySignal], coverage: &Coverage) -> BlockDecision {
    let graph_open = signals
        .iter()
        .any(|s| s.source == SignalSource::Graph && s.kind == SignalKind::BlockedBy && s.state == SignalState::Open);
    if graph_open {
        return BlockDecision::Blocked;
    }

    // Body signals are ignored once graph deps coverage is complete, to
    // avoid false positives from informal issue text.
    if !coverage.graph_deps_complete {
        let body_open = signals.iter().any(|s| {
            s.source == SignalSource::Body && s.kind == SignalKind::BlockedBy && s.state == SignalState::Open
        });
        if body_open {
            return BlockDecision::Blocked;
        }
    }

    let any_coverage_known = coverage.graph_deps_complete || coverage.graph_sub_issues_complete || coverage.body_deps;
    let any_open_signal = signals.iter().any(|s| s.state == SignalState::Open);

    if !any_coverage_known && !any_open_signal {
        return BlockDecision::Unknown;
    }

    BlockDecision::Runnable
}

/// Parses `trackedIssues`/`trackedInIssues` GraphQL shapes into dependency
/// signals. Best-effort: malformed fragments are skipped, never panicked
/// on, since the caller treats graph coverage as a flag it sets separately.
pub fn parse_graph_signals(response: &serde_json::Value) -> Vec<DependencySignal> {
    let issue = response
        .pointer("/data/repository/issue")
        .cloned()
        .unwrap_or_default();

    let mut signals = Vec::new();
    if let Some(nodes) = issue.pointer("/trackedInIssues/nodes").and_then(|v| v.as_array()) {
        for node in nodes {
            if let Some(state) = node_state(node) {
                signals.push(DependencySignal {
                    kind: SignalKind::BlockedBy,
                    source: SignalSource::Graph,
                    state,
                });
            }
        }
    }
    if let Some(nodes) = issue.pointer("/trackedIssues/nodes").and_then(|v| v.as_array()) {
        for node in nodes {
            if let Some(state) = node_state(node) {
                signals.push(DependencySignal {
                    kind: SignalKind::SubIssue,
                    source: SignalSource::Graph,
                    state,
                });
            }
        }
    }
    signals
}

fn node_state(node: &serde_json::Value) -> Option<SignalState> {
    match node.get("state").and_then(|s| s.as_str()) {
        Some("OPEN") => Some(SignalState::Open),
        Some("CLOSED") => Some(SignalState::Closed),
        _ => None,
    }
}

/// Extract `#123`-style references near "blocked by"/"depends on" phrasing
/// in an issue body. Intentionally narrow — false negatives are safer than
/// false positives, since body signals only matter when graph coverage is
/// incomplete.
pub fn extract_body_signals(body: &str, known_closed: impl Fn(u64) -> Option<bool>) -> Vec<DependencySignal> {
    let re = regex::Regex::new(r"(?i)(?:blocked by|depends on)[^\n]{0,40}?#(\d+)").unwrap();
    re.captures_iter(body)
        .filter_map(|caps| {
            let number: u64 = caps.get(1)?.as_str().parse().ok()?;
            let state = match known_closed(number) {
                Some(true) => SignalState::Closed,
                Some(false) => SignalState::Open,
                None => return None,
            };
            Some(DependencySignal {
                kind: SignalKind::BlockedBy,
                source: SignalSource::Body,
                state,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(kind: SignalKind, source: SignalSource, state: SignalState) -> DependencySignal {
        DependencySignal { kind, source, state }
    }

    #[test]
    fn open_graph_blocker_blocks() {
        let signals = vec![sig(SignalKind::BlockedBy, SignalSource::Graph, SignalState::Open)];
        let coverage = Coverage { graph_deps_complete: true, ..Default::default() };
        assert_eq!(decide(&signals, &coverage), BlockDecision::Blocked);
    }

    #[test]
    fn body_signal_ignored_when_graph_coverage_complete() {
        let signals = vec![sig(SignalKind::BlockedBy, SignalSource::Body, SignalState::Open)];
        let coverage = Coverage { graph_deps_complete: true, ..Default::default() };
        assert_eq!(decide(&signals, &coverage), BlockDecision::Runnable);
    }

    #[test]
    fn body_signal_blocks_when_graph_coverage_incomplete() {
        let signals = vec![sig(SignalKind::BlockedBy, SignalSource::Body, SignalState::Open)];
        let coverage = Coverage { graph_deps_complete: false, body_deps: true, ..Default::default() };
        assert_eq!(decide(&signals, &coverage), BlockDecision::Blocked);
    }

    #[test]
    fn unknown_coverage_and_no_signals_is_unknown() {
        let coverage = Coverage::default();
        assert_eq!(decide(&[], &coverage), BlockDecision::Unknown);
    }

    #[test]
    fn closed_signals_do_not_block() {
        let signals = vec![sig(SignalKind::BlockedBy, SignalSource::Graph, SignalState::Closed)];
        let coverage = Coverage { graph_deps_complete: true, ..Default::default() };
        assert_eq!(decide(&signals, &coverage), BlockDecision::Runnable);
    }

    #[test]
    fn extract_body_signals_matches_blocked_by_phrase() {
        let body = "This is blocked by #12 until resolved.";
        let signals = extract_body_signals(body, |n| if n == 12 { Some(false) } else { None });
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].state, SignalState::Open);
    }

    #[test]
    fn extract_body_signals_skips_unknown_numbers() {
        let body = "depends on #99";
        let signals = extract_body_signals(body, |_| None);
        assert!(signals.is_empty());
    }
}
