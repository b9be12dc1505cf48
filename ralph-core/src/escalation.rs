use crate::events::RalphEvent;
use crate::hosting::HostingClient;
use crate::label_io::upsert_marker_comment;
use crate::notify::{Notification, Notifier, Severity};
use crate::store::Store;
use crate::types::{Escalation, EscalationType, RepoId, TaskPath};
use std::sync::Arc;

/// Final escalation write-back: upserts the marker-keyed comment, persists
/// the escalation record, and notifies — with the same classified reason
/// string across all three (spec.md §4.10, §4.7 "Writeback").
pub struct EscalationWriteback {
    store: Arc<dyn Store>,
    hosting: Arc<dyn HostingClient>,
    notifier: Arc<dyn Notifier>,
}

impl EscalationWriteback {
    pub fn new(store: Arc<dyn Store>, hosting: Arc<dyn HostingClient>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, hosting, notifier }
    }

    pub async fn escalate(
        &self,
        repo: &RepoId,
        number: u64,
        task: &TaskPath,
        escalation_type: EscalationType,
        reason: &str,
        run_log_path: Option<String>,
    ) -> anyhow::Result<()> {
        let body = format!("Escalated: {reason}");
        self.hosting
            .ensure_label(repo, "ralph:escalated")
            .await
            .ok();
        upsert_marker_comment(self.hosting.as_ref(), repo, number, "escalation", &body, 1)
            .await
            .ok();

        let escalation = Escalation {
            escalation_type,
            reason: reason.to_string(),
            run_log_path,
        };
        self.store.save_escalation(task, &escalation).await?;
        self.store
            .append_event(
                &RalphEvent::Escalated {
                    task: task.clone(),
                    escalation_type,
                    reason: reason.to_string(),
                },
                chrono::Utc::now(),
            )
            .await?;

        self.notifier
            .send(Notification {
                task: task.0.clone(),
                severity: Severity::Error,
                message: reason.to_string(),
            })
            .await
            .ok();

        Ok(())
    }
}

/// An operator's `RALPH RESOLVED:` comment reconciliation (spec.md §4.6,
/// E7). Only comments from a user with owner/collaborator association
/// count; a matching text from anyone else is ignored.
pub fn is_resolved_comment(body: &str, author_association: &str) -> bool {
    let privileged = matches!(author_association, "OWNER" | "COLLABORATOR" | "MEMBER");
    privileged && body.trim_start().starts_with("RALPH RESOLVED")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_resolved_comment_is_recognized() {
        assert!(is_resolved_comment("RALPH RESOLVED: proceed", "OWNER"));
    }

    #[test]
    fn non_privileged_author_is_ignored() {
        assert!(!is_resolved_comment("RALPH RESOLVED: proceed", "NONE"));
    }

    #[test]
    fn unrelated_text_is_ignored() {
        assert!(!is_resolved_comment("looks good to me", "OWNER"));
    }
}
