use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanDecision {
    Proceed,
    Escalate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanResult {
    pub decision: PlanDecision,
    pub confidence: f32,
    pub escalation_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildResult {
    pub pr_url: Option<String>,
    pub hard_error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionExit {
    pub ok: bool,
    pub summary: String,
}

/// Abstraction over the external coding-agent subprocess (spec.md §9
/// Design Notes). Production wires a real subprocess driver; tests wire
/// an in-memory script.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn open(&self, worktree: &str, task_path: &str) -> anyhow::Result<String>;
    async fn resume(&self, session_id: &str, worktree: &str) -> anyhow::Result<()>;
    /// Send the planning instruction and parse the single RALPH_-prefixed
    /// JSON marker line. `Ok(None)` means the marker was absent/invalid —
    /// the caller decides whether to re-ask (bounded to one repair).
    async fn plan(&self, session_id: &str) -> anyhow::Result<Option<PlanResult>>;
    async fn build(&self, session_id: &str) -> anyhow::Result<BuildResult>;
    async fn survey(&self, session_id: &str) -> anyhow::Result<String>;
    async fn close(&self, session_id: &str) -> anyhow::Result<SessionExit>;
}

/// In-memory scripted `SessionRunner` for tests — returns queued
/// responses in call order per session id.
#[derive(Default)]
pub struct ScriptedSessionRunner {
    pub plan_responses: std::sync::Mutex<Vec<Option<PlanResult>>>,
    pub build_responses: std::sync::Mutex<Vec<BuildResult>>,
    pub survey_responses: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl SessionRunner for ScriptedSessionRunner {
    async fn open(&self, _worktree: &str, task_path: &str) -> anyhow::Result<String> {
        Ok(format!("session-{task_path}"))
    }

    async fn resume(&self, _session_id: &str, _worktree: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn plan(&self, _session_id: &str) -> anyhow::Result<Option<PlanResult>> {
        let mut responses = self.plan_responses.lock().unwrap();
        Ok(if responses.is_empty() { None } else { responses.remove(0) })
    }

    async fn build(&self, _session_id: &str) -> anyhow::Result<BuildResult> {
        let mut responses = self.build_responses.lock().unwrap();
        Ok(if responses.is_empty() {
            BuildResult { pr_url: None, hard_error: None }
        } else {
            responses.remove(0)
        })
    }

    async fn survey(&self, _session_id: &str) -> anyhow::Result<String> {
        let mut responses = self.survey_responses.lock().unwrap();
        Ok(if responses.is_empty() { String::new() } else { responses.remove(0) })
    }

    async fn close(&self, _session_id: &str) -> anyhow::Result<SessionExit> {
        Ok(SessionExit { ok: true, summary: "closed".into() })
    }
}

/// Parse a single `RALPH_PLAN:` prefixed JSON marker line out of agent
/// output. Any other format (missing line, multiple lines, invalid JSON)
/// is treated as absent rather than guessed.
pub fn parse_plan_marker(output: &str) -> Option<PlanResult> {
    let line = output.lines().filter(|l| l.trim_start().starts_with("RALPH_PLAN:")).last()?;
    let json_part = line.trim_start().strip_prefix("RALPH_PLAN:")?.trim();
    serde_json::from_str(json_part).ok()
}
