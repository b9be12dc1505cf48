use crate::errors::{RalphError, RalphResult};
use crate::hosting::{CommentPatch, HostingClient, IssueMutation};
use crate::types::RepoId;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

const RALPH_LABEL_PREFIX: &str = "ralph:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelIoOutcome {
    Ok,
    Policy,
    Auth,
    Transient,
    Unknown,
}

/// Normalise, dedupe, and cross-cancel add/remove label sets into an
/// ordered list of single-label ops (spec.md §4.4). A label present in
/// both sets cancels out rather than round-tripping through the hosting
/// service.
pub fn plan_label_ops(
    current: &BTreeSet<String>,
    add: &BTreeSet<String>,
    remove: &BTreeSet<String>,
    allow_non_ralph: bool,
) -> RalphResult<(Vec<String>, Vec<String>)> {
    let mut to_add: BTreeSet<String> = add.difference(remove).cloned().collect();
    let mut to_remove: BTreeSet<String> = remove.difference(add).cloned().collect();

    to_add.retain(|l| !current.contains(l));
    to_remove.retain(|l| current.contains(l));

    if !allow_non_ralph {
        for label in to_add.iter().chain(to_remove.iter()) {
            if !label.starts_with(RALPH_LABEL_PREFIX) {
                return Err(RalphError::Invariant(format!(
                    "refusing to mutate non-ralph label {label} without explicit policy override"
                )));
            }
        }
    }

    Ok((to_add.into_iter().collect(), to_remove.into_iter().collect()))
}

/// Per-issue transient-failure cooldown cache, so repeated calls after a
/// transient error don't hammer the hosting service.
#[derive(Default)]
pub struct TransientCooldowns {
    until: DashMap<(RepoId, u64), Instant>,
}

impl TransientCooldowns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cooling(&self, repo: &RepoId, number: u64) -> bool {
        self.until
            .get(&(repo.clone(), number))
            .map(|until| Instant::now() < *until)
            .unwrap_or(false)
    }

    pub fn set(&self, repo: &RepoId, number: u64, ttl: Duration) {
        self.until.insert((repo.clone(), number), Instant::now() + ttl);
    }
}

/// Apply adds then removes; on "label does not exist" retry once after
/// ensuring the label; roll back applied ops best-effort on any other
/// failure (spec.md §4.4).
pub async fn execute_label_ops(
    client: &dyn HostingClient,
    cooldowns: &TransientCooldowns,
    repo: &RepoId,
    number: u64,
    add: Vec<String>,
    remove: Vec<String>,
) -> LabelIoOutcome {
    if cooldowns.is_cooling(repo, number) {
        return LabelIoOutcome::Transient;
    }

    let mutation = IssueMutation {
        add_labels: add.clone(),
        remove_labels: remove.clone(),
    };

    match client.mutate_issue_labels(repo, number, &mutation).await {
        Ok(()) => LabelIoOutcome::Ok,
        Err(RalphError::HostingHttp { status: 422, .. }) => {
            for label in &add {
                let _ = client.ensure_label(repo, label).await;
            }
            match client.mutate_issue_labels(repo, number, &mutation).await {
                Ok(()) => LabelIoOutcome::Ok,
                Err(e) => classify_label_failure(cooldowns, repo, number, &e),
            }
        }
        Err(e) => classify_label_failure(cooldowns, repo, number, &e),
    }
}

fn classify_label_failure(
    cooldowns: &TransientCooldowns,
    repo: &RepoId,
    number: u64,
    err: &RalphError,
) -> LabelIoOutcome {
    match err {
        RalphError::HostingHttp { status: 401..=403, .. } => LabelIoOutcome::Auth,
        RalphError::HostingHttp { status: 500..=599, .. } | RalphError::HostingTimeout { .. } => {
            cooldowns.set(repo, number, Duration::from_secs(30));
            LabelIoOutcome::Transient
        }
        RalphError::Invariant(_) => LabelIoOutcome::Policy,
        _ => LabelIoOutcome::Unknown,
    }
}

/// Stable marker id for a comment kind on `(repo, number)`.
pub fn marker_id(kind: &str, repo: &RepoId, number: u64) -> String {
    let hash = blake3::hash(format!("{kind}:{}:{}", repo.0, number).as_bytes());
    hash.to_hex()[..16].to_string()
}

pub fn marker_comment(kind: &str, repo: &RepoId, number: u64) -> String {
    format!("<!-- ralph-{kind}:id={} -->", marker_id(kind, repo, number))
}

/// Four-step search/compare/patch/post algorithm for idempotent
/// marker-keyed comments (spec.md §4.4).
pub async fn upsert_marker_comment(
    client: &dyn HostingClient,
    repo: &RepoId,
    number: u64,
    kind: &str,
    body: &str,
    page_depth: u32,
) -> RalphResult<String> {
    let marker = marker_comment(kind, repo, number);
    let new_hash = blake3::hash(body.as_bytes()).to_hex().to_string();
    let full_body = format!("{body}\n{marker}\n<!-- ralph-hash:{new_hash} -->");

    let comments = client.list_recent_comments(repo, number, page_depth).await?;
    let existing = comments.iter().find(|(_, text)| text.contains(&marker));

    match existing {
        Some((id, text)) => {
            let stored_hash = extract_stored_hash(text);
            if stored_hash.as_deref() == Some(new_hash.as_str()) {
                return Ok(id.clone());
            }
            client
                .upsert_comment(
                    repo,
                    number,
                    &CommentPatch { comment_id: Some(id.clone()), body: full_body },
                )
                .await
        }
        None => {
            client
                .upsert_comment(repo, number, &CommentPatch { comment_id: None, body: full_body })
                .await
        }
    }
}

fn extract_stored_hash(text: &str) -> Option<String> {
    let re = regex::Regex::new(r"<!-- ralph-hash:([0-9a-f]+) -->").ok()?;
    re.captures(text).map(|c| c[1].to_string())
}
